// Host metrics
//
// Counters, gauges and histograms for the allocator, registry, bridge,
// sandbox and pool, exported in Prometheus text format.
//
// Admission refusals, leak reclaims, aborts and discards must be measurable
// without turning on debug logging.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::AbortReason;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down, never below zero)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub(&self, delta: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Standard latency buckets (seconds), for network-bound work
    pub fn new_latency() -> Self {
        Self::with_bounds(&[
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }

    /// Fine-grained buckets for in-process work like lend and reset
    pub fn new_fast() -> Self {
        Self::with_bounds(&[
            0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
        ])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 1e-9)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        for bucket in &self.buckets {
            bucket.count.store(0, Ordering::Relaxed);
        }
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct HostMetrics {
    // Allocator
    pub allocations_total: Counter,
    pub allocations_refused: Counter,
    pub buffers_released: Counter,
    pub buffers_finalized: Counter,
    pub leaks_reclaimed: Counter,
    pub outstanding_bytes: Gauge,
    pub mapped_bytes: Gauge,

    // Registry
    pub blob_entries_created: Counter,
    pub blob_entries_cleared: Counter,

    // Bridge
    pub operations_started: Counter,
    pub operations_completed: Counter,
    pub operations_failed: Counter,
    pub operations_aborted_explicit: Counter,
    pub operations_aborted_timeout: Counter,
    pub operations_aborted_recycled: Counter,
    pub operations_aborted_shutdown: Counter,
    pub transport_leases_released: Counter,
    pub operations_in_flight: Gauge,
    pub operation_duration: Histogram,

    // Sandbox
    pub sandbox_applied: Counter,
    pub sandbox_violations: Counter,

    // Pool
    pub contexts_created: Counter,
    pub contexts_discarded: Counter,
    pub contexts_idle: Gauge,
    pub contexts_lent: Gauge,
    pub leases_total: Counter,
    pub acquire_waits: Counter,
    pub acquire_timeouts: Counter,
    pub reset_success: Counter,
    pub reset_failure: Counter,
    pub acquire_latency: Histogram,
    pub reset_duration: Histogram,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            allocations_total: Counter::new(),
            allocations_refused: Counter::new(),
            buffers_released: Counter::new(),
            buffers_finalized: Counter::new(),
            leaks_reclaimed: Counter::new(),
            outstanding_bytes: Gauge::new(),
            mapped_bytes: Gauge::new(),

            blob_entries_created: Counter::new(),
            blob_entries_cleared: Counter::new(),

            operations_started: Counter::new(),
            operations_completed: Counter::new(),
            operations_failed: Counter::new(),
            operations_aborted_explicit: Counter::new(),
            operations_aborted_timeout: Counter::new(),
            operations_aborted_recycled: Counter::new(),
            operations_aborted_shutdown: Counter::new(),
            transport_leases_released: Counter::new(),
            operations_in_flight: Gauge::new(),
            operation_duration: Histogram::new_latency(),

            sandbox_applied: Counter::new(),
            sandbox_violations: Counter::new(),

            contexts_created: Counter::new(),
            contexts_discarded: Counter::new(),
            contexts_idle: Gauge::new(),
            contexts_lent: Gauge::new(),
            leases_total: Counter::new(),
            acquire_waits: Counter::new(),
            acquire_timeouts: Counter::new(),
            reset_success: Counter::new(),
            reset_failure: Counter::new(),
            acquire_latency: Histogram::new_fast(),
            reset_duration: Histogram::new_fast(),
        }
    }

    /// Record an abort by reason
    pub fn record_abort(&self, reason: AbortReason) {
        match reason {
            AbortReason::Explicit => self.operations_aborted_explicit.inc(),
            AbortReason::Timeout => self.operations_aborted_timeout.inc(),
            AbortReason::ContextRecycled => self.operations_aborted_recycled.inc(),
            AbortReason::Shutdown => self.operations_aborted_shutdown.inc(),
        }
    }

    /// Record a reset outcome
    pub fn record_reset(&self, success: bool, took: Duration) {
        if success {
            self.reset_success.inc();
        } else {
            self.reset_failure.inc();
        }
        self.reset_duration.observe(took);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let mut scalar = |name: &str, kind: &str, help: &str, samples: &[(&str, u64)]| {
            let _ = writeln!(out, "# HELP hostpool_{} {}", name, help);
            let _ = writeln!(out, "# TYPE hostpool_{} {}", name, kind);
            for (labels, value) in samples {
                if labels.is_empty() {
                    let _ = writeln!(out, "hostpool_{} {}", name, value);
                } else {
                    let _ = writeln!(out, "hostpool_{}{{{}}} {}", name, labels, value);
                }
            }
        };

        scalar(
            "allocations_total",
            "counter",
            "Native buffers allocated",
            &[("", self.allocations_total.get())],
        );
        scalar(
            "allocations_refused_total",
            "counter",
            "Allocations refused by admission control",
            &[("", self.allocations_refused.get())],
        );
        scalar(
            "buffers_released_total",
            "counter",
            "Native buffers whose storage was torn down",
            &[
                ("path=\"any\"", self.buffers_released.get()),
                ("path=\"finalizer\"", self.buffers_finalized.get()),
                ("path=\"leak_reclaim\"", self.leaks_reclaimed.get()),
            ],
        );
        scalar(
            "buffer_bytes",
            "gauge",
            "Bytes held by live native buffers",
            &[
                ("backing=\"all\"", self.outstanding_bytes.get()),
                ("backing=\"mapped\"", self.mapped_bytes.get()),
            ],
        );
        scalar(
            "blob_entries_total",
            "counter",
            "Blob registry entries",
            &[
                ("event=\"created\"", self.blob_entries_created.get()),
                ("event=\"cleared_on_reset\"", self.blob_entries_cleared.get()),
            ],
        );
        scalar(
            "operations_total",
            "counter",
            "Bridge operations by outcome",
            &[
                ("outcome=\"started\"", self.operations_started.get()),
                ("outcome=\"completed\"", self.operations_completed.get()),
                ("outcome=\"failed\"", self.operations_failed.get()),
                ("outcome=\"aborted\",reason=\"explicit\"", self.operations_aborted_explicit.get()),
                ("outcome=\"aborted\",reason=\"timeout\"", self.operations_aborted_timeout.get()),
                ("outcome=\"aborted\",reason=\"context_recycled\"", self.operations_aborted_recycled.get()),
                ("outcome=\"aborted\",reason=\"shutdown\"", self.operations_aborted_shutdown.get()),
            ],
        );
        scalar(
            "operations_in_flight",
            "gauge",
            "Bridge operations currently holding a transport",
            &[("", self.operations_in_flight.get())],
        );
        scalar(
            "transport_leases_released_total",
            "counter",
            "Transport leases released",
            &[("", self.transport_leases_released.get())],
        );
        scalar(
            "sandbox_total",
            "counter",
            "Sandbox applications and verification failures",
            &[
                ("event=\"applied\"", self.sandbox_applied.get()),
                ("event=\"violation\"", self.sandbox_violations.get()),
            ],
        );
        scalar(
            "contexts",
            "gauge",
            "Execution contexts by state",
            &[
                ("state=\"idle\"", self.contexts_idle.get()),
                ("state=\"lent\"", self.contexts_lent.get()),
            ],
        );
        scalar(
            "contexts_total",
            "counter",
            "Execution context lifecycle",
            &[
                ("event=\"created\"", self.contexts_created.get()),
                ("event=\"discarded\"", self.contexts_discarded.get()),
                ("event=\"lent\"", self.leases_total.get()),
            ],
        );
        scalar(
            "acquire_total",
            "counter",
            "Acquires that had to wait or timed out",
            &[
                ("result=\"waited\"", self.acquire_waits.get()),
                ("result=\"timed_out\"", self.acquire_timeouts.get()),
            ],
        );
        scalar(
            "reset_total",
            "counter",
            "Context reset outcomes",
            &[
                ("outcome=\"success\"", self.reset_success.get()),
                ("outcome=\"failure\"", self.reset_failure.get()),
            ],
        );

        for (name, help, histogram) in [
            ("operation_duration_seconds", "Bridge operation duration", &self.operation_duration),
            ("acquire_latency_seconds", "Time to obtain a context lease", &self.acquire_latency),
            ("reset_duration_seconds", "Context reset duration", &self.reset_duration),
        ] {
            let _ = writeln!(out, "# HELP hostpool_{} {}", name, help);
            let _ = writeln!(out, "# TYPE hostpool_{} histogram", name);
            for bucket in &histogram.buckets {
                let _ = writeln!(
                    out,
                    "hostpool_{}_bucket{{le=\"{}\"}} {}",
                    name,
                    bucket.le,
                    bucket.count.load(Ordering::Relaxed)
                );
            }
            let _ = writeln!(
                out,
                "hostpool_{}_bucket{{le=\"+Inf\"}} {}",
                name,
                histogram.get_count()
            );
            let _ = writeln!(
                out,
                "hostpool_{}_sum {}",
                name,
                histogram.get_sum_micros() as f64 / 1_000_000.0
            );
            let _ = writeln!(out, "hostpool_{}_count {}", name, histogram.get_count());
        }

        out
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<HostMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(HostMetrics::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<HostMetrics> {
    Arc::clone(&METRICS)
}
