/// Cancellation bridge: dispatch, handles and timeouts
///
/// Each operation gets its own handle, state word and abort signal. Work runs
/// on the bridge's tokio runtime; results go back through the context's
/// event queue. Whoever wins the terminal CAS posts the one completion event;
/// everybody else is a no-op.
use crate::bridge::queue::{CompletionEvent, ContextEvent, EventSender, Outcome, Response};
use crate::bridge::signal::{aborted, AbortSignal};
use crate::bridge::state::{OperationState, StateCell};
use crate::bridge::transport::{Request, Transport, TransportLease};
use crate::config::config::BridgeConfig;
use crate::config::types::{AbortReason, ContextId, HostError, Result};
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;

/// Everything a dispatch task needs that must not outlive its launch
struct LaunchSlot {
    request: Request,
    /// Dropped when the dispatch task exits; waiters see a disconnect
    settled: Sender<()>,
}

struct OperationShared {
    id: u64,
    context: ContextId,
    state: StateCell,
    signal: AbortSignal,
    events: EventSender,
    created_at: Instant,
    launch: Mutex<Option<LaunchSlot>>,
    settled: Receiver<()>,
    /// Flips to true on the terminal transition; stops the timeout timer
    terminal: watch::Sender<bool>,
}

impl OperationShared {
    /// Take the terminal transition; the winner posts the completion event
    fn finish(&self, outcome: Outcome) -> bool {
        let target = outcome.state();
        if !self.state.settle(target) {
            return false;
        }
        self.terminal.send_replace(true);

        let metrics = get_metrics();
        match &outcome {
            Outcome::Completed(_) => metrics.operations_completed.inc(),
            Outcome::Failed(_) => metrics.operations_failed.inc(),
            Outcome::Aborted(reason) => metrics.record_abort(*reason),
        }
        metrics.operation_duration.observe(self.created_at.elapsed());

        debug!("Operation {} settled as {}", self.id, target);
        self.events.post(ContextEvent::Completion(CompletionEvent {
            operation_id: self.id,
            outcome,
        }));
        true
    }

    fn take_launch(&self) -> Option<LaunchSlot> {
        match self.launch.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Script-visible handle to one cancellable operation; cheap to clone
#[derive(Clone)]
pub struct CancellationHandle {
    shared: Arc<OperationShared>,
}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("id", &self.shared.id)
            .field("context", &self.shared.context)
            .field("state", &self.shared.state.load())
            .finish()
    }
}

impl CancellationHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn context(&self) -> ContextId {
        self.shared.context
    }

    pub fn state(&self) -> OperationState {
        self.shared.state.load()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.shared.signal
    }

    /// Abort the operation.
    ///
    /// Valid in any state. Returns true if this call performed the terminal
    /// transition; after completion it is a no-op returning false.
    pub fn abort(&self, reason: AbortReason) -> bool {
        if !self.shared.finish(Outcome::Aborted(reason)) {
            return false;
        }
        self.shared.signal.trigger(reason);
        // Never launched: nothing will ever drop the settled sender otherwise
        drop(self.shared.take_launch());
        events::operation_aborted(self.shared.context, self.shared.id, reason);
        true
    }

    /// Wait until the dispatch task has exited and released its transport.
    ///
    /// True once settled; false if `timeout` passed first.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        match self.shared.settled.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Dispatches operations for every context in the process
///
/// Dropping the bridge stops its runtime in the background, so the last
/// owner may go away on a runtime thread or inside an async task.
pub struct CancellationBridge {
    /// Taken on drop
    runtime: Option<Runtime>,
    handle: Handle,
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    next_id: AtomicU64,
}

impl CancellationBridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("hostpool-bridge")
            .enable_time()
            .build()
            .map_err(|e| HostError::Io(format!("Failed to start bridge runtime: {}", e)))?;

        info!(
            "Cancellation bridge started with {} worker threads",
            config.worker_threads.max(1)
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            transport,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create a handle in `Pending` without dispatching anything yet
    pub fn prepare(&self, context: ContextId, events: EventSender, request: Request) -> CancellationHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (settled_tx, settled_rx) = bounded(0);
        get_metrics().operations_started.inc();

        CancellationHandle {
            shared: Arc::new(OperationShared {
                id,
                context,
                state: StateCell::new(),
                signal: AbortSignal::new(id, events.clone()),
                events,
                created_at: Instant::now(),
                launch: Mutex::new(Some(LaunchSlot {
                    request,
                    settled: settled_tx,
                })),
                settled: settled_rx,
                terminal: watch::channel(false).0,
            }),
        }
    }

    /// Dispatch a prepared operation, optionally with a hard timeout.
    ///
    /// Launching twice, or launching an already-aborted handle, does nothing.
    pub fn launch(&self, handle: &CancellationHandle, timeout: Option<Duration>) {
        let Some(slot) = handle.shared.take_launch() else {
            debug!("Operation {} already launched or settled", handle.id());
            return;
        };

        let shared = Arc::clone(&handle.shared);
        let transport = Arc::clone(&self.transport);
        let max_bytes = self.config.max_response_bytes;
        self.handle.spawn(async move {
            let LaunchSlot { request, settled } = slot;
            drive(shared, transport, request, max_bytes).await;
            drop(settled);
        });

        if let Some(timeout) = timeout {
            let timer = handle.clone();
            let mut terminal = handle.shared.terminal.subscribe();
            self.handle.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        if timer.abort(AbortReason::Timeout) {
                            events::operation_timed_out(timer.context(), timer.id(), timeout);
                        }
                    }
                    _ = async { terminal.wait_for(|settled| *settled).await.is_ok() } => {}
                }
            });
        }
    }

    /// Start an operation with no timeout
    pub fn begin(&self, context: ContextId, events: EventSender, request: Request) -> CancellationHandle {
        let handle = self.prepare(context, events, request);
        self.launch(&handle, None);
        handle
    }

    /// Start an operation that aborts itself with `Timeout` after `timeout`
    pub fn begin_with_timeout(
        &self,
        context: ContextId,
        events: EventSender,
        request: Request,
        timeout: Duration,
    ) -> CancellationHandle {
        let handle = self.prepare(context, events, request);
        self.launch(&handle, Some(timeout));
        handle
    }

    /// Stop the runtime without waiting for outstanding tasks
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            info!("Cancellation bridge shutting down");
            // Never blocks, unlike dropping the runtime
            runtime.shutdown_background();
        }
    }
}

enum Step {
    Aborted,
    Chunk(Result<Option<Vec<u8>>>),
}

async fn drive(
    shared: Arc<OperationShared>,
    transport: Arc<dyn Transport>,
    request: Request,
    max_bytes: usize,
) {
    // Pre-abort: never open transport for an operation that is already settled
    if !shared.state.begin_flight() {
        debug!("Operation {} aborted before dispatch", shared.id);
        return;
    }

    let metrics = get_metrics();
    metrics.operations_in_flight.inc();
    let mut abort_rx = shared.signal.subscribe();

    let opened = tokio::select! {
        biased;
        _ = aborted(&mut abort_rx) => None,
        result = transport.open(request) => Some(result),
    };

    match opened {
        None => debug!("Operation {} aborted while connecting", shared.id),
        Some(Err(e)) => {
            shared.finish(Outcome::Failed(e.to_string()));
        }
        Some(Ok(stream)) => {
            let mut lease = TransportLease::new(shared.id, stream);
            transfer(&shared, &mut lease, &mut abort_rx, max_bytes).await;
            lease.release();
        }
    }

    metrics.operations_in_flight.dec();
}

async fn transfer(
    shared: &OperationShared,
    lease: &mut TransportLease,
    abort_rx: &mut watch::Receiver<Option<AbortReason>>,
    max_bytes: usize,
) {
    let head = lease.head().cloned().unwrap_or_default();
    let mut body = Vec::new();

    loop {
        let step = tokio::select! {
            biased;
            _ = aborted(abort_rx) => Step::Aborted,
            chunk = lease.next_chunk() => Step::Chunk(chunk),
        };

        match step {
            Step::Aborted => {
                debug!("Operation {} aborted mid-transfer after {} bytes", shared.id, body.len());
                lease.release();
                return;
            }
            Step::Chunk(Ok(Some(bytes))) => {
                if body.len() + bytes.len() > max_bytes {
                    lease.release();
                    warn!("Operation {} response exceeded {} bytes", shared.id, max_bytes);
                    shared.finish(Outcome::Failed(format!(
                        "response body exceeds {} bytes",
                        max_bytes
                    )));
                    return;
                }
                body.extend_from_slice(&bytes);
            }
            Step::Chunk(Ok(None)) => break,
            Step::Chunk(Err(e)) => {
                lease.release();
                shared.finish(Outcome::Failed(e.to_string()));
                return;
            }
        }
    }

    // Release before publishing so a completed result never holds a connection
    lease.release();
    shared.finish(Outcome::Completed(Response {
        status: head.status,
        headers: head.headers,
        body,
    }));
}
