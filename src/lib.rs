//! hostpool: pooled, leak-free execution contexts for untrusted scripts
//!
//! Every script runs in an execution context borrowed from a pool. The
//! context exposes a small set of host capabilities and is reset to a
//! known-clean state before anyone else can borrow it.
//!
//! # Architecture
//!
//! ## Native Memory ([`memory`])
//! - [`memory::allocator`]: Admission-controlled allocation and per-context leak ledgers
//! - [`memory::backing`]: Inline heap vs. anonymous `mmap` storage
//! - [`memory::buffer`]: Script-visible buffer wrappers with dispose/finalize
//!
//! ## Object Registry ([`registry`])
//! - [`registry::blob`]: Per-context, generation-scoped blob and file handles
//! - [`registry::token`]: Unguessable handle tokens
//!
//! ## Cancellation Bridge ([`bridge`])
//! - [`bridge::dispatch`]: Operation handles, dispatch and timeouts
//! - [`bridge::signal`]: One-shot abort signals
//! - [`bridge::state`]: Linearizable operation state word
//! - [`bridge::queue`]: Generation-filtered context event queue
//! - [`bridge::transport`]: Transport seam and exactly-once lease release
//!
//! ## Capability Sandbox ([`sandbox`])
//! - [`sandbox::policy`]: Forbidden globals, intrinsics and pivot paths
//! - [`sandbox::realm`]: Interpreter realm seam and object graph realm
//! - [`sandbox::capability`]: Apply once, verify after every reset
//!
//! ## Context Pool ([`pool`])
//! - [`pool::context`]: Execution contexts and their factory
//! - [`pool::pool`]: Lending, backpressure and discard
//!
//! ## Safety ([`safety`])
//! - [`safety::cleanup`]: Reset sequence and baseline equivalence
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured security events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: Configuration loading and environment overrides
//! - [`config::validator`]: Startup validation
//! - [`config::types`]: Shared identifiers and the error taxonomy
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::mock_transport`]: Scripted transport with release counters
//! - [`testing::race_proof`]: Release and cancellation race proofs

// Native Memory
pub mod memory;

// Object Registry
pub mod registry;

// Cancellation Bridge
pub mod bridge;

// Capability Sandbox
pub mod sandbox;

// Context Pool
pub mod pool;

// Safety & Reset
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the hostpool binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::config::HostConfig;
pub use config::types::*;
pub use pool::{ContextLease, ContextPool, ExecutionContext};
