/// Core types shared across the hostpool crate
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one pooled execution context.
///
/// Stable for the lifetime of the context object; combined with a
/// [`Generation`] it scopes every per-request resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short, token-safe rendering (hyphen-free hex)
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn parse_simple(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Monotonic tag bumped every time a pooled context is reset for reuse
pub type Generation = u64;

/// First generation assigned to a freshly created context
pub const INITIAL_GENERATION: Generation = 1;

/// Why an operation was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Script code called abort on the handle
    #[serde(rename = "explicit")]
    Explicit,
    /// The configured hard timeout fired
    #[serde(rename = "timeout")]
    Timeout,
    /// The owning context was reset while the operation was outstanding
    #[serde(rename = "context_recycled")]
    ContextRecycled,
    /// The bridge is shutting down
    #[serde(rename = "shutdown")]
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Explicit => write!(f, "explicit"),
            AbortReason::Timeout => write!(f, "timeout"),
            AbortReason::ContextRecycled => write!(f, "context_recycled"),
            AbortReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Error taxonomy for hostpool
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    /// Allocation ceiling or process budget hit, detected before commit
    #[error("Resource exhausted: requested {requested} bytes, {detail}")]
    ResourceExhausted { requested: usize, detail: String },

    /// Registry miss. Deliberately carries no detail: a foreign token, a stale
    /// generation, a revoked token and an unknown token look the same.
    #[error("Not found")]
    NotFound,

    #[error("Operation aborted ({0})")]
    Aborted(AbortReason),

    /// Context failed capability verification; never shown to script code
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Buffer already released")]
    BufferReleased,

    #[error("Out of bounds: offset {offset} + len {len} exceeds {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("No execution context available after {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Pool is shut down")]
    PoolShutdown,

    /// A reset step left the context unfit for reuse
    #[error("Reset failed: {0}")]
    ResetFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl HostError {
    /// Whether a script frame may observe this error as a catchable failure
    pub fn is_script_visible(&self) -> bool {
        !matches!(
            self,
            HostError::SandboxViolation(_)
                | HostError::PoolExhausted { .. }
                | HostError::PoolShutdown
                | HostError::ResetFailed(_)
                | HostError::Config(_)
                | HostError::Io(_)
        )
    }

    /// Stable short name, used by audit events and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::ResourceExhausted { .. } => "resource_exhausted",
            HostError::NotFound => "not_found",
            HostError::Aborted(_) => "aborted",
            HostError::SandboxViolation(_) => "sandbox_violation",
            HostError::TransportFailure(_) => "transport_failure",
            HostError::BufferReleased => "buffer_released",
            HostError::OutOfBounds { .. } => "out_of_bounds",
            HostError::PoolExhausted { .. } => "pool_exhausted",
            HostError::PoolShutdown => "pool_shutdown",
            HostError::ResetFailed(_) => "reset_failed",
            HostError::Config(_) => "config",
            HostError::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Io(err.to_string())
    }
}

impl From<nix::errno::Errno> for HostError {
    fn from(err: nix::errno::Errno) -> Self {
        HostError::Io(err.to_string())
    }
}

/// Result type alias for hostpool operations
pub type Result<T> = std::result::Result<T, HostError>;
