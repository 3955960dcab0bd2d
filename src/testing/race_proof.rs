/// Race proofs for release and cancellation paths
///
/// Drives the two races that must resolve to exactly one effect: explicit
/// dispose against the collector finalizer on one buffer wrapper, and
/// explicit abort against the timeout timer on one operation handle.
use crate::bridge::dispatch::CancellationBridge;
use crate::bridge::queue::{ContextEvent, EventQueue};
use crate::bridge::transport::Request;
use crate::config::types::{AbortReason, ContextId, Result};
use crate::memory::allocator::{AllocationHint, AllocatorStats, BufferAllocator};
use crate::testing::mock_transport::MockCounters;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Race proof configuration
#[derive(Debug, Clone)]
pub struct RaceProofConfig {
    /// Number of test iterations
    pub iterations: usize,

    /// Threads racing on the same object per iteration
    pub threads: usize,

    /// Buffer size for dispose/finalize races
    pub buffer_size: usize,
}

impl Default for RaceProofConfig {
    fn default() -> Self {
        RaceProofConfig {
            iterations: 100,
            threads: 4,
            buffer_size: 64 * 1024,
        }
    }
}

/// Race proof result
#[derive(Debug, Clone)]
pub struct RaceProofResult {
    /// Total iterations run
    pub iterations: usize,

    /// Number of successful iterations
    pub successes: usize,

    /// Number of failed iterations
    pub failures: usize,

    /// What went wrong, one line per failed iteration
    pub violations: Vec<String>,
}

impl RaceProofResult {
    pub fn new(iterations: usize) -> Self {
        RaceProofResult {
            iterations,
            successes: 0,
            failures: 0,
            violations: Vec::new(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.failures == 0 && self.violations.is_empty()
    }

    fn record(&mut self, iteration: usize, violation: Option<String>) {
        match violation {
            None => self.successes += 1,
            Some(v) => {
                self.failures += 1;
                self.violations.push(format!("iteration {}: {}", iteration, v));
            }
        }
    }
}

/// Race `dispose` against `finalize` on shared wrappers of one allocation.
///
/// `allocator` should be private to the caller so stats deltas are exact.
pub fn prove_dispose_finalize(
    allocator: &BufferAllocator,
    config: &RaceProofConfig,
) -> Result<RaceProofResult> {
    let mut result = RaceProofResult::new(config.iterations);
    let owner = ContextId::new();
    let threads = config.threads.max(2);

    log::info!(
        "Starting dispose/finalize race proof: {} iterations x {} threads",
        config.iterations,
        threads
    );

    for iteration in 0..config.iterations {
        let before = allocator.stats();
        let primary = Arc::new(allocator.allocate(owner, config.buffer_size, AllocationHint::Auto)?);
        let secondary = Arc::new(primary.share()?);
        let barrier = Arc::new(Barrier::new(threads));
        let dispose_wins = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..threads)
            .map(|i| {
                let target = if i % 2 == 0 {
                    Arc::clone(&primary)
                } else {
                    Arc::clone(&secondary)
                };
                let barrier = Arc::clone(&barrier);
                let dispose_wins = Arc::clone(&dispose_wins);
                thread::spawn(move || {
                    barrier.wait();
                    if i % 4 < 2 {
                        if target.dispose() {
                            dispose_wins.fetch_add(1, Ordering::SeqCst);
                        }
                    } else {
                        target.finalize();
                    }
                })
            })
            .collect();

        let mut panicked = false;
        for worker in workers {
            panicked |= worker.join().is_err();
        }
        drop(primary);
        drop(secondary);

        let after = allocator.stats();
        let violation = release_violation(
            &before,
            &after,
            dispose_wins.load(Ordering::SeqCst),
            panicked,
        );
        result.record(iteration, violation);
    }

    log::info!(
        "Dispose/finalize race proof complete: {}/{} successes",
        result.successes,
        result.iterations
    );
    Ok(result)
}

/// What went wrong in one dispose/finalize iteration, if anything
fn release_violation(
    before: &AllocatorStats,
    after: &AllocatorStats,
    dispose_wins: usize,
    panicked: bool,
) -> Option<String> {
    let releases = after.total_releases.saturating_sub(before.total_releases);
    if panicked {
        Some("worker panicked".to_string())
    } else if releases != 1 {
        Some(format!("storage released {} times", releases))
    } else if after.outstanding_bytes != before.outstanding_bytes {
        Some(format!(
            "outstanding bytes moved by {}",
            after.outstanding_bytes.abs_diff(before.outstanding_bytes)
        ))
    } else if dispose_wins > 2 {
        Some("more dispose wins than wrappers".to_string())
    } else {
        None
    }
}

/// Race an explicit abort against a timeout on operations that never finish
/// on their own. `stalling_url` must make the transport hang mid-body.
pub fn prove_abort_timeout(
    bridge: &CancellationBridge,
    counters: &MockCounters,
    stalling_url: &str,
    config: &RaceProofConfig,
) -> RaceProofResult {
    let mut result = RaceProofResult::new(config.iterations);
    let context = ContextId::new();

    log::info!(
        "Starting abort/timeout race proof: {} iterations",
        config.iterations
    );

    for iteration in 0..config.iterations {
        let queue = EventQueue::new();
        let timeout = Duration::from_millis(fastrand::u64(1..=3));
        let handle = bridge.begin_with_timeout(
            context,
            queue.sender(),
            Request::get(stalling_url),
            timeout,
        );

        let racer = handle.clone();
        // Jitter the explicit abort across the timeout window
        let delay = Duration::from_micros(fastrand::u64(0..=3_000));
        let explicit = thread::spawn(move || {
            thread::sleep(delay);
            racer.abort(AbortReason::Explicit)
        });
        let explicit_won = explicit.join().unwrap_or(false);

        if !handle.wait_settled(Duration::from_secs(5)) {
            result.record(iteration, Some("dispatch task never settled".to_string()));
            continue;
        }

        let mut completions = Vec::new();
        while let Some(event) = queue.next_timeout(Duration::from_millis(50)) {
            if let ContextEvent::Completion(c) = event {
                completions.push(c);
            }
        }

        let violation = match completions.as_slice() {
            [only] => match only.outcome.clone().into_result() {
                Err(crate::config::types::HostError::Aborted(reason)) => {
                    let expected = if explicit_won {
                        AbortReason::Explicit
                    } else {
                        AbortReason::Timeout
                    };
                    (reason != expected)
                        .then(|| format!("delivered {} but {} won the race", reason, expected))
                }
                other => Some(format!("expected an abort, got {:?}", other)),
            },
            many => Some(format!("{} completion events delivered", many.len())),
        };
        result.record(iteration, violation);
    }

    if counters.open_streams() != 0 {
        result.violations.push(format!(
            "{} transport streams left open",
            counters.open_streams()
        ));
    }
    if counters.leaked() != 0 {
        result
            .violations
            .push(format!("{} streams dropped without release", counters.leaked()));
    }

    log::info!(
        "Abort/timeout race proof complete: {}/{} successes",
        result.successes,
        result.iterations
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::{AllocatorConfig, BridgeConfig};
    use crate::testing::mock_transport::{MockResponse, MockTransport};

    #[test]
    fn test_dispose_finalize_race_releases_once() {
        let allocator = BufferAllocator::new(AllocatorConfig {
            inline_threshold_bytes: 1024,
            max_allocation_bytes: 1 << 20,
            process_budget_bytes: 1 << 24,
        });
        let config = RaceProofConfig {
            iterations: 50,
            ..Default::default()
        };
        let result = prove_dispose_finalize(&allocator, &config).unwrap();
        assert!(result.is_pass(), "{:?}", result.violations);
        assert_eq!(allocator.stats().live_allocations, 0);
    }

    #[test]
    fn test_abort_timeout_race_settles_once() {
        let transport = MockTransport::new().with_response("mock://stall", MockResponse::stalling(1));
        let counters = transport.counters();
        let bridge = CancellationBridge::new(BridgeConfig::default(), Arc::new(transport)).unwrap();

        let config = RaceProofConfig {
            iterations: 30,
            ..Default::default()
        };
        let result = prove_abort_timeout(&bridge, &counters, "mock://stall", &config);
        assert!(result.is_pass(), "{:?}", result.violations);
        bridge.shutdown();
    }

    #[test]
    fn test_release_violation_reports_one_cause() {
        let before = AllocatorStats {
            outstanding_bytes: 100,
            total_releases: 4,
            ..Default::default()
        };
        let released_once = AllocatorStats {
            outstanding_bytes: 40,
            total_releases: 5,
            ..Default::default()
        };

        // A panic wins over every accounting symptom
        assert_eq!(
            release_violation(&before, &released_once, 3, true).as_deref(),
            Some("worker panicked")
        );
        // Outstanding bytes going down must not underflow
        assert_eq!(
            release_violation(&before, &released_once, 1, false).as_deref(),
            Some("outstanding bytes moved by 60")
        );

        let clean = AllocatorStats {
            outstanding_bytes: 100,
            total_releases: 5,
            ..Default::default()
        };
        assert_eq!(release_violation(&before, &clean, 1, false), None);
        assert_eq!(
            release_violation(&before, &before, 1, false).as_deref(),
            Some("storage released 0 times")
        );
        assert_eq!(
            release_violation(&before, &clean, 3, false).as_deref(),
            Some("more dispose wins than wrappers")
        );
    }

    #[test]
    fn test_each_iteration_recorded_once() {
        let allocator = BufferAllocator::new(AllocatorConfig {
            inline_threshold_bytes: 1024,
            max_allocation_bytes: 1 << 20,
            process_budget_bytes: 1 << 24,
        });
        let config = RaceProofConfig {
            iterations: 25,
            ..Default::default()
        };
        let result = prove_dispose_finalize(&allocator, &config).unwrap();
        assert_eq!(result.iterations, 25);
        assert_eq!(result.successes + result.failures, 25);
    }
}
