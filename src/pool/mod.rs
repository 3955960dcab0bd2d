//! Execution context pool
//!
//! Sealed contexts created ahead of demand, lent out one at a time and reset
//! or discarded when they come back.

pub mod context;
pub mod pool;

pub use context::{
    ContextFactory, ContextInfo, ExecutionContext, HeapSlot, HeapValue, RealmFactory, ScriptHeap, StandardRealms,
};
pub use pool::{ContextLease, ContextPool, PoolStats};
