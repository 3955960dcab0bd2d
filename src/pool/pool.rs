/// Execution context pool
///
/// Warm contexts are lent out behind exclusive leases. Admission grows the
/// pool up to `max_contexts` and then waits on a condition variable until a
/// lease comes back or `acquire_timeout` passes. Returned contexts go through
/// the reset sequence; anything that fails it, or has used up its reuse or
/// error budget, is discarded and replaced on demand.
use crate::bridge::transport::Transport;
use crate::config::config::{HostConfig, PoolConfig};
use crate::config::types::{HostError, Result};
use crate::config::validator::validate_config;
use crate::memory::allocator::BufferAllocator;
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use crate::pool::context::{ContextFactory, ExecutionContext, StandardRealms};
use crate::safety::cleanup::ResetSequence;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle: usize,
    /// Live contexts, idle or lent
    pub total: usize,
    pub lent: usize,
    pub created: u64,
    pub discarded: u64,
    /// Acquires that had to wait for a lease to come back
    pub waits: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<ExecutionContext>,
    total: usize,
    lent: usize,
    created: u64,
    discarded: u64,
    waits: u64,
    shutdown: bool,
}

impl PoolState {
    fn publish(&self) {
        let metrics = get_metrics();
        metrics.contexts_idle.set(self.idle.len() as u64);
        metrics.contexts_lent.set(self.lent as u64);
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: ContextFactory,
    reset: ResetSequence,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// What admission decided while holding the lock
enum Admission {
    Idle(ExecutionContext),
    Create,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn admit(&self) -> Result<Admission> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();
        let mut waited = false;
        let mut state = self.state();

        loop {
            if state.shutdown {
                return Err(HostError::PoolShutdown);
            }
            if let Some(ctx) = state.idle.pop_front() {
                state.lent += 1;
                state.publish();
                return Ok(Admission::Idle(ctx));
            }
            if state.total < self.config.max_contexts {
                // Reserve the slot now; the context is built outside the lock
                state.total += 1;
                state.lent += 1;
                state.publish();
                return Ok(Admission::Create);
            }

            if !waited {
                waited = true;
                state.waits += 1;
                get_metrics().acquire_waits.inc();
                debug!("Pool at capacity ({}), waiting", self.config.max_contexts);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let waited = started.elapsed();
                get_metrics().acquire_timeouts.inc();
                events::pool_exhausted(waited, self.config.max_contexts);
                warn!("No execution context available after {:?}", waited);
                return Err(HostError::PoolExhausted { waited });
            }

            state = match self.available.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Give back a slot reserved by `admit` whose context never materialized
    fn unreserve(&self) {
        let mut state = self.state();
        state.total -= 1;
        state.lent -= 1;
        state.publish();
        self.available.notify_one();
    }

    fn discard(&self, mut ctx: ExecutionContext, reason: &str) {
        info!(
            "Discarding context {} at generation {}: {}",
            ctx.id(),
            ctx.generation(),
            reason
        );
        get_metrics().contexts_discarded.inc();
        events::context_discarded(ctx.id(), ctx.generation(), reason);
        ctx.retire();
        drop(ctx);
    }

    fn retirement_reason(&self, ctx: &ExecutionContext) -> Option<&'static str> {
        if self.config.max_errors > 0 && ctx.error_count() >= self.config.max_errors {
            return Some("error budget exhausted");
        }
        if self.config.max_reuse > 0 && ctx.lend_count() >= self.config.max_reuse {
            return Some("reuse budget exhausted");
        }
        None
    }

    /// Take a context back from a lease
    fn give_back(&self, mut ctx: ExecutionContext, failed: bool) {
        if failed {
            ctx.error_count += 1;
        }

        let shutting_down = self.state().shutdown;
        let verdict = if shutting_down {
            Err("pool shut down".to_string())
        } else if let Some(reason) = self.retirement_reason(&ctx) {
            Err(reason.to_string())
        } else {
            let started = Instant::now();
            let result = self.reset.run(&mut ctx);
            get_metrics().record_reset(result.is_ok(), started.elapsed());
            result.map(|_| ()).map_err(|e| format!("reset failed ({})", e.kind()))
        };

        match verdict {
            Ok(()) => {
                let mut state = self.state();
                state.lent -= 1;
                if state.shutdown {
                    // Shut down while resetting
                    state.total -= 1;
                    state.discarded += 1;
                    state.publish();
                    drop(state);
                    self.discard(ctx, "pool shut down");
                } else {
                    state.idle.push_back(ctx);
                    state.publish();
                }
            }
            Err(reason) => {
                {
                    let mut state = self.state();
                    state.lent -= 1;
                    state.total -= 1;
                    state.discarded += 1;
                    state.publish();
                }
                self.discard(ctx, &reason);
                self.replenish();
            }
        }
        self.available.notify_one();
    }

    /// Create contexts until `min_idle` are available again
    fn replenish(&self) {
        loop {
            {
                let mut state = self.state();
                if state.shutdown
                    || state.idle.len() >= self.config.min_idle
                    || state.total >= self.config.max_contexts
                {
                    return;
                }
                state.total += 1;
            }

            match self.factory.create() {
                Ok(ctx) => {
                    let mut state = self.state();
                    state.created += 1;
                    if state.shutdown {
                        state.total -= 1;
                        state.discarded += 1;
                        drop(state);
                        self.discard(ctx, "pool shut down");
                        return;
                    }
                    state.idle.push_back(ctx);
                    state.publish();
                    self.available.notify_one();
                }
                Err(e) => {
                    warn!("Failed to replenish execution context: {}", e);
                    let mut state = self.state();
                    state.total -= 1;
                    return;
                }
            }
        }
    }
}

/// Pool of sealed execution contexts; cheap to clone
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl ContextPool {
    /// Build a pool and warm `min_idle` contexts
    pub fn new(config: PoolConfig, factory: ContextFactory) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                reset: ResetSequence::default(),
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        };

        let warm = pool.inner.config.min_idle.min(pool.inner.config.max_contexts);
        for _ in 0..warm {
            let ctx = pool.inner.factory.create()?;
            let mut state = pool.inner.state();
            state.total += 1;
            state.created += 1;
            state.idle.push_back(ctx);
            state.publish();
        }

        info!(
            "Context pool ready: {} warm, up to {} contexts",
            warm, pool.inner.config.max_contexts
        );
        Ok(pool)
    }

    /// Validate `config` and build a pool of standard realms over `transport`
    pub fn from_config(config: &HostConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        validate_config(config)?;
        let factory = ContextFactory::new(config, transport, StandardRealms)?;
        Self::new(config.pool.clone(), factory)
    }

    /// Like `from_config`, but charging buffers to a shared `allocator`
    pub fn with_allocator(
        config: &HostConfig,
        allocator: BufferAllocator,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        validate_config(config)?;
        let factory = ContextFactory::with_allocator(config, allocator, transport, StandardRealms)?;
        Self::new(config.pool.clone(), factory)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &ContextFactory {
        &self.inner.factory
    }

    /// Borrow a context, creating or waiting for one as needed
    pub fn acquire(&self) -> Result<ContextLease> {
        let started = Instant::now();
        let mut ctx = match self.inner.admit()? {
            Admission::Idle(ctx) => ctx,
            Admission::Create => match self.inner.factory.create() {
                Ok(ctx) => {
                    self.inner.state().created += 1;
                    ctx
                }
                Err(e) => {
                    self.inner.unreserve();
                    return Err(e);
                }
            },
        };

        ctx.lend_count += 1;
        ctx.last_lent = Some(chrono::Utc::now());
        let metrics = get_metrics();
        metrics.leases_total.inc();
        metrics.acquire_latency.observe(started.elapsed());
        debug!("Lent context {} (lending #{})", ctx.id(), ctx.lend_count());

        Ok(ContextLease {
            pool: Arc::clone(&self.inner),
            ctx: ManuallyDrop::new(ctx),
            failed: false,
        })
    }

    /// Acquire, run `f`, release. An error from `f` counts against the
    /// context's error budget.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ExecutionContext) -> Result<T>,
    {
        let mut lease = self.acquire()?;
        let result = f(&mut lease);
        if result.is_err() {
            lease.mark_failed();
        }
        lease.release();
        result
    }

    /// Drop every idle context and refuse further acquires. Lent contexts
    /// are discarded when their leases come back.
    pub fn shutdown(&self) {
        let drained: Vec<ExecutionContext> = {
            let mut state = self.inner.state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            state.discarded += drained.len() as u64;
            state.publish();
            drained
        };
        self.inner.available.notify_all();

        info!("Context pool shutting down, {} idle contexts dropped", drained.len());
        for ctx in drained {
            self.inner.discard(ctx, "pool shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state().shutdown
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            idle: state.idle.len(),
            total: state.total,
            lent: state.lent,
            created: state.created,
            discarded: state.discarded,
            waits: state.waits,
        }
    }
}

/// Exclusive loan of one context; returned to the pool on drop
pub struct ContextLease {
    pool: Arc<PoolInner>,
    ctx: ManuallyDrop<ExecutionContext>,
    failed: bool,
}

impl ContextLease {
    /// Count this lending against the context's error budget
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Return the context now
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for ContextLease {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.ctx
    }
}

impl DerefMut for ContextLease {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        &mut self.ctx
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        // SAFETY: `ctx` is taken exactly once, here, and never touched again.
        let ctx = unsafe { ManuallyDrop::take(&mut self.ctx) };
        self.pool.give_back(ctx, self.failed);
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context", &*self.ctx)
            .field("failed", &self.failed)
            .finish()
    }
}
