//! Cancellation bridge
//!
//! Cancellable host operations started by script code: one handle and one
//! one-shot abort signal per operation, results posted back onto the owning
//! context's event queue.

pub mod dispatch;
pub mod queue;
pub mod signal;
pub mod state;
pub mod transport;

pub use dispatch::{CancellationBridge, CancellationHandle};
pub use queue::{CompletionEvent, ContextEvent, EventQueue, EventSender, Outcome, Response};
pub use signal::AbortSignal;
pub use state::OperationState;
pub use transport::{Request, ResponseHead, ResponseStream, Transport, TransportLease};
