/// Context reset and baseline equivalence
///
/// Runs between lendings. Every step is ordered: operations are cancelled
/// before their queue is drained, the heap is dropped before the registry so
/// finalizers see live records, and the sandbox is verified last against the
/// state sealed at creation. Any failing step makes the context unfit for
/// reuse; the pool discards it and never tries to repair it.
use crate::config::types::{AbortReason, ContextId, Generation, HostError, Result};
use crate::memory::allocator::LeakReport;
use crate::observability::audit::events;
use crate::pool::context::ExecutionContext;
use crate::sandbox::capability;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// How long reset waits for an aborted operation to release its transport
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Steps of the reset sequence, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStep {
    AbortOperations,
    DrainQueue,
    DropHeap,
    ClearRegistry,
    ReclaimBuffers,
    AdvanceGeneration,
    VerifySandbox,
    CheckBaseline,
}

impl fmt::Display for ResetStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetStep::AbortOperations => "abort_operations",
            ResetStep::DrainQueue => "drain_queue",
            ResetStep::DropHeap => "drop_heap",
            ResetStep::ClearRegistry => "clear_registry",
            ResetStep::ReclaimBuffers => "reclaim_buffers",
            ResetStep::AdvanceGeneration => "advance_generation",
            ResetStep::VerifySandbox => "verify_sandbox",
            ResetStep::CheckBaseline => "check_baseline",
        };
        write!(f, "{}", name)
    }
}

/// What one reset had to clean up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetReport {
    pub context: ContextId,
    /// Generation the context carries after the reset
    pub generation: Generation,
    pub aborted_operations: usize,
    pub drained_events: usize,
    pub heap_values_dropped: usize,
    pub blobs_cleared: usize,
    pub leaks: LeakReport,
    pub took: Duration,
}

impl ResetReport {
    /// Whether the script left nothing behind
    pub fn is_clean(&self) -> bool {
        self.aborted_operations == 0 && self.blobs_cleared == 0 && self.leaks.is_clean()
    }
}

/// Snapshot of per-lending state that must be empty between lendings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBaseline {
    pub pending_operations: usize,
    pub queued_events: usize,
    pub heap_values: usize,
    pub registry_entries: usize,
    pub live_buffers: usize,
    pub registry_generation: Generation,
    pub context_generation: Generation,
}

impl ContextBaseline {
    pub fn capture(ctx: &ExecutionContext) -> Self {
        Self {
            pending_operations: ctx.outstanding.len(),
            queued_events: ctx.queue.len(),
            heap_values: ctx.heap.len(),
            registry_entries: ctx.registry.len(),
            live_buffers: ctx.allocations.live_count(),
            registry_generation: ctx.registry.generation(),
            context_generation: ctx.generation,
        }
    }

    /// Every way this snapshot differs from a freshly created context
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.pending_operations != 0 {
            violations.push(format!("{} operations still tracked", self.pending_operations));
        }
        if self.queued_events != 0 {
            violations.push(format!("{} events still queued", self.queued_events));
        }
        if self.heap_values != 0 {
            violations.push(format!("{} heap values survived", self.heap_values));
        }
        if self.registry_entries != 0 {
            violations.push(format!("{} blob entries survived", self.registry_entries));
        }
        if self.live_buffers != 0 {
            violations.push(format!("{} buffers still live", self.live_buffers));
        }
        if self.registry_generation != self.context_generation {
            violations.push(format!(
                "registry generation {} does not match context generation {}",
                self.registry_generation, self.context_generation
            ));
        }
        violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations().is_empty()
    }
}

/// The reset sequence run on every returned context
#[derive(Debug, Clone)]
pub struct ResetSequence {
    settle_timeout: Duration,
}

impl Default for ResetSequence {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_TIMEOUT)
    }
}

impl ResetSequence {
    pub fn new(settle_timeout: Duration) -> Self {
        Self { settle_timeout }
    }

    /// Reset `ctx` for its next lending.
    ///
    /// On error the context must be discarded; it may be half reset.
    pub fn run(&self, ctx: &mut ExecutionContext) -> Result<ResetReport> {
        let started = Instant::now();
        let id = ctx.id;

        let result = self.run_steps(ctx, started);
        match &result {
            Ok(report) if report.is_clean() => {
                debug!("Reset {} to generation {} in {:?}", id, report.generation, report.took)
            }
            Ok(report) => info!(
                "Reset {} reclaimed {} operations, {} blobs, {} buffers ({} bytes)",
                id,
                report.aborted_operations,
                report.blobs_cleared,
                report.leaks.reclaimed_buffers,
                report.leaks.reclaimed_bytes
            ),
            Err(e) => warn!("Reset of {} failed: {}", id, e),
        }
        result
    }

    fn run_steps(&self, ctx: &mut ExecutionContext, started: Instant) -> Result<ResetReport> {
        let aborted_operations = self.abort_operations(ctx)?;

        let drained_events = ctx.queue.drain();
        debug!("{}: {} events drained", ResetStep::DrainQueue, drained_events);

        let heap_values_dropped = ctx.heap.clear();
        debug!("{}: {} values dropped", ResetStep::DropHeap, heap_values_dropped);

        let blobs_cleared = ctx
            .registry
            .clear_all(ctx.id)
            .map_err(|e| step_failed(ResetStep::ClearRegistry, e))?;

        let leaks = ctx.allocations.reclaim_leaks();
        if !leaks.is_clean() {
            debug!(
                "{}: {} buffers force-released",
                ResetStep::ReclaimBuffers,
                leaks.reclaimed_buffers
            );
        }

        ctx.generation += 1;
        ctx.queue.advance(ctx.generation);
        debug!("{}: now {}", ResetStep::AdvanceGeneration, ctx.generation);

        if let Err(e) = capability::verify(ctx.realm.as_ref(), &ctx.policy, &ctx.baseline) {
            error!("{} failed for {}: {}", ResetStep::VerifySandbox, ctx.id, e);
            events::sandbox_violation(ctx.id, ctx.generation, &e.to_string());
            return Err(e);
        }

        let baseline = ContextBaseline::capture(ctx);
        let violations = baseline.violations();
        if !violations.is_empty() {
            error!("Context {} baseline violations: {:?}", ctx.id, violations);
            return Err(HostError::ResetFailed(format!(
                "{}: {}",
                ResetStep::CheckBaseline,
                violations.join("; ")
            )));
        }

        Ok(ResetReport {
            context: ctx.id,
            generation: ctx.generation,
            aborted_operations,
            drained_events,
            heap_values_dropped,
            blobs_cleared,
            leaks,
            took: started.elapsed(),
        })
    }

    /// Abort everything still running and wait for transports to be released
    fn abort_operations(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        let handles: Vec<_> = ctx.outstanding.drain(..).collect();
        let aborted = handles
            .iter()
            .filter(|h| h.abort(AbortReason::ContextRecycled))
            .count();

        let deadline = Instant::now() + self.settle_timeout;
        for handle in &handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !handle.wait_settled(remaining) {
                return Err(step_failed(
                    ResetStep::AbortOperations,
                    HostError::ResetFailed(format!(
                        "operation {} did not settle within {:?}",
                        handle.id(),
                        self.settle_timeout
                    )),
                ));
            }
        }

        if aborted > 0 {
            debug!("{}: {} operations cancelled", ResetStep::AbortOperations, aborted);
        }
        Ok(aborted)
    }
}

fn step_failed(step: ResetStep, err: HostError) -> HostError {
    match err {
        HostError::ResetFailed(detail) => HostError::ResetFailed(format!("{}: {}", step, detail)),
        other => HostError::ResetFailed(format!("{}: {}", step, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::Request;
    use crate::config::config::{AllocatorConfig, HostConfig};
    use crate::memory::allocator::AllocationHint;
    use crate::pool::context::{ContextFactory, HeapValue, StandardRealms};
    use crate::testing::mock_transport::{MockResponse, MockTransport};
    use std::sync::Arc;

    fn factory(transport: MockTransport) -> ContextFactory {
        let config = HostConfig {
            allocator: AllocatorConfig {
                inline_threshold_bytes: 1024,
                max_allocation_bytes: 1 << 20,
                process_budget_bytes: 1 << 24,
            },
            ..Default::default()
        };
        ContextFactory::new(&config, Arc::new(transport), StandardRealms).unwrap()
    }

    #[test]
    fn test_reset_of_untouched_context_is_clean() {
        let factory = factory(MockTransport::new());
        let mut ctx = factory.create().unwrap();

        let report = ResetSequence::default().run(&mut ctx).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.generation, 2);
        assert!(ContextBaseline::capture(&ctx).is_clean());
    }

    #[test]
    fn test_reset_reclaims_everything_a_script_left() {
        let transport = MockTransport::new().with_response("mock://slow", MockResponse::stalling(1));
        let counters = transport.counters();
        let factory = factory(transport);
        let mut ctx = factory.create().unwrap();

        let leaked = ctx.allocate_buffer(4096, AllocationHint::PreferMapped).unwrap();
        let kept = ctx.allocate_buffer(16, AllocationHint::Auto).unwrap();
        ctx.heap_mut().hold(HeapValue::Buffer(kept));
        let token = ctx.create_blob(b"left behind", "text/plain").unwrap();
        let op = ctx.fetch(Request::get("mock://slow"));

        let report = ResetSequence::default().run(&mut ctx).unwrap();
        assert_eq!(report.aborted_operations, 1);
        assert_eq!(report.blobs_cleared, 1);
        assert_eq!(report.heap_values_dropped, 1);
        assert!(report.leaks.reclaimed_buffers >= 1);
        assert_eq!(op.state(), crate::bridge::state::OperationState::Aborted);
        assert_eq!(counters.open_streams(), 0);

        assert_eq!(ctx.resolve_blob(&token).unwrap_err(), HostError::NotFound);
        assert!(leaked.read(0, 1).is_err());
        assert_eq!(factory.allocator().stats().live_allocations, 0);
    }

    #[test]
    fn test_tampered_realm_fails_reset() {
        let factory = factory(MockTransport::new());
        let mut ctx = factory.create().unwrap();

        // A script deleting a built-in changes the shared surface
        assert!(ctx.realm_mut().remove_global("Object"));

        let err = ResetSequence::default().run(&mut ctx).unwrap_err();
        assert!(matches!(err, HostError::SandboxViolation(_)));
        assert!(!err.is_script_visible());
    }
}
