//! Object/blob registry
//!
//! Generation-scoped opaque handles mapping to binary payloads, one registry
//! per execution context.

pub mod blob;
pub mod token;

pub use blob::{BlobEntryView, BlobPayload, BlobRegistry, FileInfo};
pub use token::BlobToken;
