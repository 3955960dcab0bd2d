//! Capability sandbox
//!
//! Allow-list-by-removal over a script realm's global surface, re-verified
//! after every context reset.

pub mod capability;
pub mod policy;
pub mod realm;

pub use capability::{apply, typeof_global, typeof_path, verify, SealedBaseline};
pub use policy::{Intrinsic, PivotPath, PivotStart, SandboxPolicy};
pub use realm::{ObjectGraph, ObjectId, ScriptRealm, Value};
