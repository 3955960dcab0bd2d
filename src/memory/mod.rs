//! Native buffer memory
//!
//! Admission-controlled allocation with inline or memory-mapped backing,
//! reference counting with a finalizer backstop, and per-context leak ledgers.

pub mod allocator;
pub mod backing;
pub mod buffer;

pub use allocator::{AllocationHint, AllocatorStats, BufferAllocator, ContextAllocations, LeakReport};
pub use backing::BackingKind;
pub use buffer::BufferRef;
