/// Opaque blob handle tokens
///
/// Layout: `blob:<context>/<generation>/<sequence>/<nonce>`. The sequence is
/// only unique inside one registry generation; the random nonce is what makes
/// a token unguessable. Parsing never fails loudly: anything malformed is
/// simply a token that resolves to nothing.
use crate::config::types::{ContextId, Generation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const SCHEME: &str = "blob:";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobToken(String);

/// Decoded token fields
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenParts {
    pub context: ContextId,
    pub generation: Generation,
    pub sequence: u64,
    pub nonce: Uuid,
}

impl BlobToken {
    pub(crate) fn mint(context: ContextId, generation: Generation, sequence: u64) -> (Self, Uuid) {
        let nonce = Uuid::new_v4();
        let token = format!(
            "{}{}/{}/{}/{}",
            SCHEME,
            context.simple(),
            generation,
            sequence,
            nonce.simple()
        );
        (Self(token), nonce)
    }

    /// Wrap a string handed back by script code
    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Option<TokenParts> {
        let rest = self.0.strip_prefix(SCHEME)?;
        let mut fields = rest.split('/');
        let context = ContextId::parse_simple(fields.next()?)?;
        let generation = fields.next()?.parse().ok()?;
        let sequence = fields.next()?.parse().ok()?;
        let nonce_raw = fields.next()?;
        if fields.next().is_some() || nonce_raw.len() != 32 {
            return None;
        }
        let nonce = Uuid::parse_str(nonce_raw).ok()?;
        Some(TokenParts {
            context,
            generation,
            sequence,
            nonce,
        })
    }
}

impl fmt::Display for BlobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_parses() {
        let ctx = ContextId::new();
        let (token, nonce) = BlobToken::mint(ctx, 7, 42);
        let parts = token.parse().unwrap();
        assert_eq!(parts.context, ctx);
        assert_eq!(parts.generation, 7);
        assert_eq!(parts.sequence, 42);
        assert_eq!(parts.nonce, nonce);
    }

    #[test]
    fn test_same_coordinates_mint_distinct_tokens() {
        let ctx = ContextId::new();
        let (a, _) = BlobToken::mint(ctx, 1, 1);
        let (b, _) = BlobToken::mint(ctx, 1, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_tokens() {
        for raw in [
            "",
            "blob:",
            "https://example.com/x",
            "blob:zz/1/1/00000000000000000000000000000000",
            "blob:00000000000000000000000000000000/x/1/00000000000000000000000000000000",
            "blob:00000000000000000000000000000000/1/1/00000000000000000000000000000000/extra",
        ] {
            assert!(BlobToken::from_string(raw).parse().is_none(), "{raw}");
        }
    }
}
