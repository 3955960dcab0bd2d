//! Safety and cleanup
//!
//! The reset sequence that returns a lent context to a state equivalent to a
//! freshly created one, or reports why it cannot.

pub mod cleanup;

pub use cleanup::{ContextBaseline, ResetReport, ResetSequence, ResetStep};
