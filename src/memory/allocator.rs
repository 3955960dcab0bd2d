/// Native buffer allocator with admission control
///
/// Every allocation is reserved against the process budget with a CAS loop
/// before any storage is committed, so an over-budget request fails cheaply
/// instead of pushing the host into swap or the OOM killer.
///
/// Accounting is lock-free. Per-allocation state sits behind its own mutex and
/// the per-context ledger is owned by its context, so no single lock
/// serializes allocation traffic across contexts.
use crate::config::config::AllocatorConfig;
use crate::config::types::{ContextId, HostError, Result};
use crate::memory::backing::{Backing, BackingKind};
use crate::memory::buffer::BufferRef;
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Caller preference for the backing path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocationHint {
    /// Pick by size threshold
    #[default]
    Auto,
    /// Stay on the heap when the size allows it
    PreferInline,
    /// Map even below the threshold (e.g. buffers expected to grow shared)
    PreferMapped,
}

/// Snapshot of allocator accounting
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub outstanding_bytes: usize,
    pub live_allocations: usize,
    pub mapped_bytes: usize,
    pub inline_bytes: usize,
    pub refused_allocations: u64,
    pub total_allocations: u64,
    pub total_releases: u64,
}

/// Process-wide accounting shared by every allocation record
#[derive(Debug)]
pub(crate) struct AllocatorShared {
    config: AllocatorConfig,
    outstanding: AtomicUsize,
    live: AtomicUsize,
    mapped_bytes: AtomicUsize,
    inline_bytes: AtomicUsize,
    refused: AtomicU64,
    total_allocations: AtomicU64,
    total_releases: AtomicU64,
    next_id: AtomicU64,
}

impl AllocatorShared {
    fn reserve(&self, size: usize) -> Result<()> {
        let budget = self.config.process_budget_bytes;
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= budget => next,
                _ => {
                    return Err(HostError::ResourceExhausted {
                        requested: size,
                        detail: format!(
                            "process budget {} bytes with {} outstanding",
                            budget, current
                        ),
                    })
                }
            };
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self, size: usize) {
        self.outstanding.fetch_sub(size, Ordering::AcqRel);
    }

    fn kind_counter(&self, kind: BackingKind) -> &AtomicUsize {
        match kind {
            BackingKind::Inline => &self.inline_bytes,
            BackingKind::Mapped => &self.mapped_bytes,
        }
    }

    /// Storage for one record was torn down
    fn on_reclaimed(&self, size: usize, kind: BackingKind) {
        self.kind_counter(kind).fetch_sub(size, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.total_releases.fetch_add(1, Ordering::Relaxed);
        self.unreserve(size);

        let metrics = get_metrics();
        metrics.buffers_released.inc();
        metrics.outstanding_bytes.sub(size as u64);
        if kind == BackingKind::Mapped {
            metrics.mapped_bytes.sub(size as u64);
        }
    }
}

/// Bookkeeping for one native allocation.
///
/// Holds only process-level accounting, never context state: the last
/// release may come from a finalizer long after the owning context was
/// recycled.
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    id: u64,
    size: usize,
    kind: BackingKind,
    owner: ContextId,
    refcount: AtomicUsize,
    released: AtomicBool,
    storage: Mutex<Option<Backing>>,
    shared: Arc<AllocatorShared>,
}

impl AllocationRecord {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn kind(&self) -> BackingKind {
        self.kind
    }

    pub(crate) fn owner(&self) -> ContextId {
        self.owner
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Lock the storage; `None` inside means the record was reclaimed
    pub(crate) fn storage(&self) -> MutexGuard<'_, Option<Backing>> {
        match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a reference unless the count already hit zero
    pub(crate) fn try_retain(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Drop one reference. Returns true when this call tore the storage down.
    pub(crate) fn release_ref(&self) -> bool {
        let previous = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.teardown(),
            Ok(_) => false,
            Err(_) => {
                debug!("Release on buffer {} with zero refcount ignored", self.id);
                false
            }
        }
    }

    /// Reclaim regardless of outstanding references (leak backstop)
    pub(crate) fn force_reclaim(&self) -> bool {
        self.refcount.store(0, Ordering::Release);
        self.teardown()
    }

    fn teardown(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let backing = self.storage().take();
        drop(backing);
        self.shared.on_reclaimed(self.size, self.kind);
        debug!(
            "Reclaimed buffer {} ({} bytes, {:?})",
            self.id, self.size, self.kind
        );
        true
    }
}

/// Process-wide native buffer allocator; cheap to clone
#[derive(Clone, Debug)]
pub struct BufferAllocator {
    shared: Arc<AllocatorShared>,
}

impl BufferAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        info!(
            "Buffer allocator: inline below {} bytes, ceiling {} bytes, budget {} bytes",
            config.inline_threshold_bytes, config.max_allocation_bytes, config.process_budget_bytes
        );
        Self {
            shared: Arc::new(AllocatorShared {
                config,
                outstanding: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                mapped_bytes: AtomicUsize::new(0),
                inline_bytes: AtomicUsize::new(0),
                refused: AtomicU64::new(0),
                total_allocations: AtomicU64::new(0),
                total_releases: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.shared.config
    }

    fn choose_backing(&self, size: usize, hint: AllocationHint) -> BackingKind {
        if size == 0 {
            return BackingKind::Inline;
        }
        match hint {
            AllocationHint::PreferMapped => BackingKind::Mapped,
            _ if size >= self.shared.config.inline_threshold_bytes => BackingKind::Mapped,
            _ => BackingKind::Inline,
        }
    }

    fn refuse(&self, owner: ContextId, err: HostError) -> HostError {
        self.shared.refused.fetch_add(1, Ordering::Relaxed);
        get_metrics().allocations_refused.inc();
        events::allocation_refused(owner, &err.to_string());
        err
    }

    /// Allocate a zeroed buffer owned by `owner`.
    ///
    /// Fails with `ResourceExhausted` before touching the OS when the size
    /// exceeds the per-allocation ceiling or the process budget.
    pub fn allocate(&self, owner: ContextId, size: usize, hint: AllocationHint) -> Result<BufferRef> {
        let ceiling = self.shared.config.max_allocation_bytes;
        if size > ceiling {
            return Err(self.refuse(
                owner,
                HostError::ResourceExhausted {
                    requested: size,
                    detail: format!("per-allocation ceiling is {} bytes", ceiling),
                },
            ));
        }

        if let Err(e) = self.shared.reserve(size) {
            return Err(self.refuse(owner, e));
        }

        let kind = self.choose_backing(size, hint);
        let backing = match Backing::new(kind, size) {
            Ok(backing) => backing,
            Err(e) => {
                self.shared.unreserve(size);
                warn!("Backing commit failed for {} bytes: {}", size, e);
                return Err(self.refuse(owner, e));
            }
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.kind_counter(kind).fetch_add(size, Ordering::AcqRel);
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        self.shared.total_allocations.fetch_add(1, Ordering::Relaxed);

        let metrics = get_metrics();
        metrics.allocations_total.inc();
        metrics.outstanding_bytes.add(size as u64);
        if kind == BackingKind::Mapped {
            metrics.mapped_bytes.add(size as u64);
        }

        debug!("Allocated buffer {} ({} bytes, {:?}) for {}", id, size, kind, owner);

        let record = Arc::new(AllocationRecord {
            id,
            size,
            kind,
            owner,
            refcount: AtomicUsize::new(1),
            released: AtomicBool::new(false),
            storage: Mutex::new(Some(backing)),
            shared: Arc::clone(&self.shared),
        });
        Ok(BufferRef::from_record(record))
    }

    /// Add a reference; the returned wrapper must be disposed or finalized
    pub fn retain(&self, buf: &BufferRef) -> Result<BufferRef> {
        buf.share()
    }

    /// Drop a reference. Releasing an already-disposed wrapper is a no-op.
    pub fn release(&self, buf: &BufferRef) -> bool {
        buf.dispose()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            outstanding_bytes: self.shared.outstanding.load(Ordering::Acquire),
            live_allocations: self.shared.live.load(Ordering::Acquire),
            mapped_bytes: self.shared.mapped_bytes.load(Ordering::Acquire),
            inline_bytes: self.shared.inline_bytes.load(Ordering::Acquire),
            refused_allocations: self.shared.refused.load(Ordering::Relaxed),
            total_allocations: self.shared.total_allocations.load(Ordering::Relaxed),
            total_releases: self.shared.total_releases.load(Ordering::Relaxed),
        }
    }
}

/// What the leak backstop had to reclaim on reset
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    pub reclaimed_buffers: usize,
    pub reclaimed_bytes: usize,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        self.reclaimed_buffers == 0
    }
}

/// Per-context ledger of allocations, used to find leaks on reset
#[derive(Debug)]
pub struct ContextAllocations {
    owner: ContextId,
    allocator: BufferAllocator,
    records: Mutex<Vec<Weak<AllocationRecord>>>,
}

/// Compact the ledger once it holds this many entries
const PRUNE_THRESHOLD: usize = 256;

impl ContextAllocations {
    pub fn new(owner: ContextId, allocator: BufferAllocator) -> Self {
        Self {
            owner,
            allocator,
            records: Mutex::new(Vec::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<Weak<AllocationRecord>>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Allocate on behalf of this context and track the record
    pub fn allocate(&self, size: usize, hint: AllocationHint) -> Result<BufferRef> {
        let buf = self.allocator.allocate(self.owner, size, hint)?;
        let mut records = self.records();
        if records.len() >= PRUNE_THRESHOLD {
            records.retain(|w| w.upgrade().map(|r| !r.is_released()).unwrap_or(false));
        }
        records.push(Arc::downgrade(buf.record()));
        Ok(buf)
    }

    /// Allocations owned by this context that still hold storage
    pub fn live_count(&self) -> usize {
        self.records()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|r| !r.is_released())
            .count()
    }

    /// Force-reclaim everything this context still owns
    pub fn reclaim_leaks(&self) -> LeakReport {
        let drained: Vec<Weak<AllocationRecord>> = std::mem::take(&mut *self.records());
        let mut report = LeakReport::default();

        for record in drained.iter().filter_map(Weak::upgrade) {
            if record.force_reclaim() {
                report.reclaimed_buffers += 1;
                report.reclaimed_bytes += record.size();
            }
        }

        if !report.is_clean() {
            get_metrics().leaks_reclaimed.add(report.reclaimed_buffers as u64);
            events::leak_reclaimed(self.owner, report.reclaimed_buffers, report.reclaimed_bytes);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn allocator(threshold: usize, ceiling: usize, budget: usize) -> BufferAllocator {
        BufferAllocator::new(AllocatorConfig {
            inline_threshold_bytes: threshold,
            max_allocation_bytes: ceiling,
            process_budget_bytes: budget,
        })
    }

    #[test]
    fn test_budget_admits_ten_refuses_eleventh() {
        let alloc = allocator(64 * 1024, 256 * MIB, 1024 * MIB);
        let owner = ContextId::new();
        let mut held = Vec::new();

        for i in 0..10 {
            let buf = alloc
                .allocate(owner, 100 * MIB, AllocationHint::Auto)
                .unwrap_or_else(|e| panic!("allocation {} failed: {}", i, e));
            assert!(buf.is_mapped());
            held.push(buf);
        }

        let err = alloc.allocate(owner, 100 * MIB, AllocationHint::Auto).unwrap_err();
        assert!(matches!(err, HostError::ResourceExhausted { .. }));
        assert_eq!(alloc.stats().refused_allocations, 1);
        assert_eq!(alloc.outstanding_bytes(), 1000 * MIB);

        drop(held);
        assert_eq!(alloc.outstanding_bytes(), 0);
        assert!(alloc.allocate(owner, 100 * MIB, AllocationHint::Auto).is_ok());
    }

    #[test]
    fn test_ceiling_checked_before_budget() {
        let alloc = allocator(1024, 4096, MIB);
        let err = alloc
            .allocate(ContextId::new(), 4097, AllocationHint::Auto)
            .unwrap_err();
        assert!(matches!(err, HostError::ResourceExhausted { .. }));
        assert_eq!(alloc.outstanding_bytes(), 0);
    }

    #[test]
    fn test_threshold_selects_backing() {
        let alloc = allocator(1024, MIB, 4 * MIB);
        let owner = ContextId::new();

        let small = alloc.allocate(owner, 1023, AllocationHint::Auto).unwrap();
        let edge = alloc.allocate(owner, 1024, AllocationHint::Auto).unwrap();
        let forced = alloc.allocate(owner, 10, AllocationHint::PreferMapped).unwrap();
        let ignored = alloc.allocate(owner, 4096, AllocationHint::PreferInline).unwrap();

        assert!(!small.is_mapped());
        assert!(edge.is_mapped());
        assert!(forced.is_mapped());
        assert!(ignored.is_mapped());

        let stats = alloc.stats();
        assert_eq!(stats.inline_bytes, 1023);
        assert_eq!(stats.mapped_bytes, 1024 + 10 + 4096);
    }

    #[test]
    fn test_zero_length_is_free() {
        let alloc = allocator(1024, MIB, 16);
        let empty = alloc
            .allocate(ContextId::new(), 0, AllocationHint::PreferMapped)
            .unwrap();
        assert_eq!(empty.len(), 0);
        assert!(!empty.is_mapped());
        assert_eq!(alloc.outstanding_bytes(), 0);
    }

    #[test]
    fn test_retain_release_teardown_once() {
        let alloc = allocator(1024, MIB, 4 * MIB);
        let first = alloc.allocate(ContextId::new(), 8192, AllocationHint::Auto).unwrap();
        let second = alloc.retain(&first).unwrap();
        assert_eq!(first.refcount(), 2);

        assert!(alloc.release(&first));
        assert!(!alloc.release(&first));
        assert_eq!(alloc.stats().live_allocations, 1);

        assert!(alloc.release(&second));
        let stats = alloc.stats();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.total_releases, 1);
        assert_eq!(stats.outstanding_bytes, 0);

        assert_eq!(alloc.retain(&second).unwrap_err(), HostError::BufferReleased);
    }

    #[test]
    fn test_context_ledger_reclaims_leaks() {
        let alloc = allocator(1024, MIB, 4 * MIB);
        let ledger = ContextAllocations::new(ContextId::new(), alloc.clone());

        let leaked = ledger.allocate(4096, AllocationHint::Auto).unwrap();
        let dropped = ledger.allocate(100, AllocationHint::Auto).unwrap();
        drop(dropped);
        assert_eq!(ledger.live_count(), 1);

        let report = ledger.reclaim_leaks();
        assert_eq!(report.reclaimed_buffers, 1);
        assert_eq!(report.reclaimed_bytes, 4096);
        assert_eq!(alloc.outstanding_bytes(), 0);

        // The escaped wrapper now observes reclamation instead of stale memory
        assert_eq!(leaked.read(0, 1).unwrap_err(), HostError::BufferReleased);
        drop(leaked);
        assert_eq!(alloc.stats().total_releases, 2);
    }
}
