/// Per-context object/blob registry
///
/// One registry instance belongs to one execution context. Resolution only
/// ever consults this instance, and every token is bound to the generation it
/// was minted in, so a reset context cannot resurrect entries from an earlier
/// request even if the script never revoked them.
use crate::config::types::{ContextId, Generation, HostError, Result, INITIAL_GENERATION};
use crate::memory::buffer::BufferRef;
use crate::observability::metrics::get_metrics;
use crate::registry::token::BlobToken;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Bytes held by a registry entry
#[derive(Debug)]
pub enum BlobPayload {
    /// Copied bytes owned by the registry
    Bytes(Arc<[u8]>),
    /// Reference to a native buffer; the entry holds one reference
    Buffer(BufferRef),
}

impl BlobPayload {
    pub fn len(&self) -> usize {
        match self {
            BlobPayload::Bytes(bytes) => bytes.len(),
            BlobPayload::Buffer(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn share(&self) -> Result<BlobPayload> {
        match self {
            BlobPayload::Bytes(bytes) => Ok(BlobPayload::Bytes(Arc::clone(bytes))),
            BlobPayload::Buffer(buf) => buf.share().map(BlobPayload::Buffer),
        }
    }

    fn slice(&self, start: usize, end: usize) -> Result<BlobPayload> {
        match self {
            BlobPayload::Bytes(bytes) => Ok(BlobPayload::Bytes(Arc::from(&bytes[start..end]))),
            BlobPayload::Buffer(buf) => buf.slice(start, end).map(BlobPayload::Buffer),
        }
    }

    /// Copy the payload out
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        match self {
            BlobPayload::Bytes(bytes) => Ok(bytes.to_vec()),
            BlobPayload::Buffer(buf) => buf.to_vec(),
        }
    }
}

/// File-style metadata attached to a blob
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: u64,
}

/// Registry entry
#[derive(Debug)]
struct BlobEntry {
    nonce: Uuid,
    payload: BlobPayload,
    mime_type: String,
    owner: ContextId,
    generation: Generation,
    created_at: SystemTime,
    file: Option<FileInfo>,
}

/// What `resolve` hands back to script code
#[derive(Debug)]
pub struct BlobEntryView {
    pub token: BlobToken,
    pub payload: BlobPayload,
    pub mime_type: String,
    pub owner: ContextId,
    pub generation: Generation,
    pub created_at: SystemTime,
    pub file: Option<FileInfo>,
}

impl BlobEntryView {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Normalize a MIME type the way Blob constructors do: lowercase printable
/// ASCII, anything else collapses to the empty type.
pub fn normalize_mime_type(raw: &str) -> String {
    if raw.chars().all(|c| ('\u{20}'..='\u{7e}').contains(&c)) {
        raw.to_ascii_lowercase()
    } else {
        String::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct BlobRegistry {
    context: ContextId,
    generation: Generation,
    next_sequence: u64,
    entries: HashMap<u64, BlobEntry>,
}

impl BlobRegistry {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            generation: INITIAL_GENERATION,
            next_sequence: 1,
            entries: HashMap::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_payload_bytes(&self) -> usize {
        self.entries.values().map(|e| e.payload.len()).sum()
    }

    fn insert(&mut self, payload: BlobPayload, mime_type: &str, file: Option<FileInfo>) -> BlobToken {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let (token, nonce) = BlobToken::mint(self.context, self.generation, sequence);

        self.entries.insert(
            sequence,
            BlobEntry {
                nonce,
                payload,
                mime_type: normalize_mime_type(mime_type),
                owner: self.context,
                generation: self.generation,
                created_at: SystemTime::now(),
                file,
            },
        );
        get_metrics().blob_entries_created.inc();
        debug!("Minted blob handle {} in {}", sequence, self.context);
        token
    }

    /// Register a payload and mint a handle for it
    pub fn create(&mut self, payload: BlobPayload, mime_type: &str) -> BlobToken {
        self.insert(payload, mime_type, None)
    }

    /// Register a File-style payload with a name and modification time.
    ///
    /// `last_modified` defaults to now.
    pub fn create_file(
        &mut self,
        payload: BlobPayload,
        mime_type: &str,
        name: &str,
        last_modified: Option<u64>,
    ) -> BlobToken {
        let file = FileInfo {
            name: name.to_string(),
            last_modified: last_modified.unwrap_or_else(now_millis),
        };
        self.insert(payload, mime_type, Some(file))
    }

    /// Look the token up in this registry only
    fn lookup(&self, token: &BlobToken) -> Option<(u64, &BlobEntry)> {
        let parts = token.parse()?;
        if parts.context != self.context || parts.generation != self.generation {
            return None;
        }
        let entry = self.entries.get(&parts.sequence)?;
        if entry.nonce != parts.nonce {
            return None;
        }
        Some((parts.sequence, entry))
    }

    /// Resolve a handle. Every kind of miss is the same `NotFound`.
    pub fn resolve(&self, token: &BlobToken) -> Result<BlobEntryView> {
        let (_, entry) = self.lookup(token).ok_or(HostError::NotFound)?;
        let payload = entry.payload.share().map_err(|_| HostError::NotFound)?;
        Ok(BlobEntryView {
            token: token.clone(),
            payload,
            mime_type: entry.mime_type.clone(),
            owner: entry.owner,
            generation: entry.generation,
            created_at: entry.created_at,
            file: entry.file.clone(),
        })
    }

    /// Derive a new handle over `[start, end)` of an existing one.
    ///
    /// Bounds are clamped to the payload like `Blob.slice`.
    pub fn slice(
        &mut self,
        token: &BlobToken,
        start: usize,
        end: usize,
        mime_type: Option<&str>,
    ) -> Result<BlobToken> {
        let (payload, inherited_type) = {
            let (_, entry) = self.lookup(token).ok_or(HostError::NotFound)?;
            let size = entry.payload.len();
            let end = end.min(size);
            let start = start.min(end);
            let payload = entry
                .payload
                .slice(start, end)
                .map_err(|_| HostError::NotFound)?;
            (payload, entry.mime_type.clone())
        };
        let mime = mime_type.unwrap_or(&inherited_type).to_string();
        Ok(self.insert(payload, &mime, None))
    }

    /// Drop a handle. Revoking twice or revoking garbage is not an error.
    pub fn revoke(&mut self, token: &BlobToken) {
        if let Some((sequence, _)) = self.lookup(token) {
            if let Some(entry) = self.entries.remove(&sequence) {
                debug!("Revoked blob handle {} in {}", sequence, self.context);
                drop(entry);
            }
        }
    }

    /// Remove every entry and advance to the next generation.
    ///
    /// Called by the pool exactly once per reset. Returns the number of
    /// entries the script left behind.
    pub fn clear_all(&mut self, context: ContextId) -> Result<usize> {
        if context != self.context {
            return Err(HostError::Config(format!(
                "registry of {} asked to clear {}",
                self.context, context
            )));
        }
        let cleared = self.entries.len();
        self.entries.clear();
        self.generation += 1;
        self.next_sequence = 1;

        if cleared > 0 {
            get_metrics().blob_entries_cleared.add(cleared as u64);
            info!(
                "Cleared {} unrevoked blob handles from {} (now generation {})",
                cleared, self.context, self.generation
            );
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::AllocatorConfig;
    use crate::memory::allocator::{AllocationHint, BufferAllocator};

    fn bytes(data: &[u8]) -> BlobPayload {
        BlobPayload::Bytes(Arc::from(data))
    }

    #[test]
    fn test_create_resolve_revoke() {
        let mut registry = BlobRegistry::new(ContextId::new());
        let token = registry.create(bytes(b"hello"), "Text/Plain");

        let view = registry.resolve(&token).unwrap();
        assert_eq!(view.payload.to_vec().unwrap(), b"hello");
        assert_eq!(view.mime_type, "text/plain");
        assert_eq!(view.generation, INITIAL_GENERATION);

        registry.revoke(&token);
        registry.revoke(&token);
        registry.revoke(&BlobToken::from_string("garbage"));
        assert_eq!(registry.resolve(&token).unwrap_err(), HostError::NotFound);
    }

    #[test]
    fn test_foreign_context_token_not_found() {
        let mut a = BlobRegistry::new(ContextId::new());
        let b = BlobRegistry::new(ContextId::new());
        let token = a.create(bytes(b"secret"), "");
        assert_eq!(b.resolve(&token).unwrap_err(), HostError::NotFound);
    }

    #[test]
    fn test_clear_all_bumps_generation_and_invalidates() {
        let ctx = ContextId::new();
        let mut registry = BlobRegistry::new(ctx);
        let tokens: Vec<BlobToken> = (0..5).map(|i| registry.create(bytes(&[i]), "")).collect();

        assert_eq!(registry.clear_all(ctx).unwrap(), 5);
        assert_eq!(registry.generation(), INITIAL_GENERATION + 1);
        assert!(registry.is_empty());
        for token in &tokens {
            assert_eq!(registry.resolve(token).unwrap_err(), HostError::NotFound);
        }

        // Sequence restarts, but the old token still cannot match the new entry
        let fresh = registry.create(bytes(b"new"), "");
        assert_eq!(fresh.parse().unwrap().sequence, 1);
        assert_eq!(registry.resolve(&tokens[0]).unwrap_err(), HostError::NotFound);
        assert!(registry.resolve(&fresh).is_ok());
    }

    #[test]
    fn test_clear_all_rejects_other_context() {
        let mut registry = BlobRegistry::new(ContextId::new());
        assert!(registry.clear_all(ContextId::new()).is_err());
    }

    #[test]
    fn test_forged_nonce_not_found() {
        let mut registry = BlobRegistry::new(ContextId::new());
        let token = registry.create(bytes(b"x"), "");
        let parts = token.parse().unwrap();
        let forged = BlobToken::from_string(format!(
            "blob:{}/{}/{}/{}",
            parts.context.simple(),
            parts.generation,
            parts.sequence,
            Uuid::new_v4().simple()
        ));
        assert_eq!(registry.resolve(&forged).unwrap_err(), HostError::NotFound);
    }

    #[test]
    fn test_mime_normalization() {
        assert_eq!(normalize_mime_type("Image/PNG"), "image/png");
        assert_eq!(normalize_mime_type("text/plain\u{0}"), "");
        assert_eq!(normalize_mime_type("tëxt"), "");
    }

    #[test]
    fn test_file_and_slice() {
        let mut registry = BlobRegistry::new(ContextId::new());
        let file = registry.create_file(bytes(b"0123456789"), "text/csv", "data.csv", Some(1_700_000_000_000));

        let view = registry.resolve(&file).unwrap();
        let info = view.file.clone().unwrap();
        assert_eq!(info.name, "data.csv");
        assert_eq!(info.last_modified, 1_700_000_000_000);

        let part = registry.slice(&file, 2, 100, None).unwrap();
        let part_view = registry.resolve(&part).unwrap();
        assert_eq!(part_view.payload.to_vec().unwrap(), b"23456789");
        assert_eq!(part_view.mime_type, "text/csv");
        assert!(part_view.file.is_none());
        assert_eq!(registry.total_payload_bytes(), 18);
    }

    #[test]
    fn test_buffer_payload_released_on_clear() {
        let alloc = BufferAllocator::new(AllocatorConfig::default());
        let ctx = ContextId::new();
        let mut registry = BlobRegistry::new(ctx);

        let buf = alloc.allocate(ctx, 128, AllocationHint::Auto).unwrap();
        buf.write(0, b"payload").unwrap();
        let token = registry.create(BlobPayload::Buffer(buf.share().unwrap()), "application/octet-stream");
        drop(buf);
        assert_eq!(alloc.stats().live_allocations, 1);

        let view = registry.resolve(&token).unwrap();
        assert_eq!(view.payload.to_vec().unwrap()[..7], *b"payload");
        drop(view);

        registry.clear_all(ctx).unwrap();
        assert_eq!(alloc.stats().live_allocations, 0);
    }
}
