/// Execution context: one isolated script environment
///
/// Owns everything a lending may touch: the realm, the blob registry, the
/// buffer ledger, outstanding bridge operations, the event queue and the
/// script heap. At most one thread drives a context at a time; the pool hands
/// it out behind an exclusive lease.
use crate::bridge::dispatch::{CancellationBridge, CancellationHandle};
use crate::bridge::queue::{ContextEvent, EventQueue};
use crate::bridge::signal::AbortSignal;
use crate::bridge::transport::{Request, Transport};
use crate::config::config::HostConfig;
use crate::config::types::{AbortReason, ContextId, Generation, Result, INITIAL_GENERATION};
use crate::memory::allocator::{AllocationHint, BufferAllocator, ContextAllocations};
use crate::memory::buffer::BufferRef;
use crate::observability::audit::events;
use crate::observability::metrics::get_metrics;
use crate::registry::blob::{BlobEntryView, BlobPayload, BlobRegistry};
use crate::registry::token::BlobToken;
use crate::sandbox::capability::{self, SealedBaseline};
use crate::sandbox::policy::SandboxPolicy;
use crate::sandbox::realm::{ObjectGraph, ScriptRealm};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Prune settled handles from the outstanding list past this length
const OUTSTANDING_PRUNE_THRESHOLD: usize = 64;

/// A value a script keeps alive between host calls
#[derive(Debug)]
pub enum HeapValue {
    Buffer(BufferRef),
    Blob(BlobToken),
    Operation(CancellationHandle),
    Signal(AbortSignal),
}

/// Index of a slot in the script heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapSlot(usize);

/// Host-side stand-in for the interpreter's heap.
///
/// Dropping a value runs the same path the collector would: buffers are
/// finalized, tokens and handles simply go away.
#[derive(Debug, Default)]
pub struct ScriptHeap {
    slots: Vec<Option<HeapValue>>,
    live: usize,
}

impl ScriptHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, value: HeapValue) -> HeapSlot {
        self.live += 1;
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(value);
            return HeapSlot(index);
        }
        self.slots.push(Some(value));
        HeapSlot(self.slots.len() - 1)
    }

    pub fn get(&self, slot: HeapSlot) -> Option<&HeapValue> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    pub fn take(&mut self, slot: HeapSlot) -> Option<HeapValue> {
        let value = self.slots.get_mut(slot.0).and_then(Option::take);
        if value.is_some() {
            self.live -= 1;
        }
        value
    }

    /// Collect one value as the garbage collector would
    pub fn collect(&mut self, slot: HeapSlot) -> bool {
        self.take(slot).is_some()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every value. Returns how many were live.
    pub fn clear(&mut self) -> usize {
        let dropped = self.live;
        self.slots.clear();
        self.live = 0;
        dropped
    }
}

/// Builds fresh interpreter realms for new contexts
pub trait RealmFactory: Send + Sync {
    fn create_realm(&self) -> Result<Box<dyn ScriptRealm>>;
}

impl<F> RealmFactory for F
where
    F: Fn() -> Result<Box<dyn ScriptRealm>> + Send + Sync,
{
    fn create_realm(&self) -> Result<Box<dyn ScriptRealm>> {
        self()
    }
}

/// Realms seeded with the standard host surface
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRealms;

impl RealmFactory for StandardRealms {
    fn create_realm(&self) -> Result<Box<dyn ScriptRealm>> {
        Ok(Box::new(ObjectGraph::standard()))
    }
}

/// Everything shared by the contexts of one pool
pub struct ContextFactory {
    allocator: BufferAllocator,
    bridge: Arc<CancellationBridge>,
    policy: Arc<SandboxPolicy>,
    realms: Box<dyn RealmFactory>,
}

impl ContextFactory {
    /// Factory with its own allocator built from `config.allocator`
    pub fn new<R>(config: &HostConfig, transport: Arc<dyn Transport>, realms: R) -> Result<Self>
    where
        R: RealmFactory + 'static,
    {
        let allocator = BufferAllocator::new(config.allocator.clone());
        Self::with_allocator(config, allocator, transport, realms)
    }

    /// Factory drawing from an existing allocator. Every factory and pool
    /// given clones of one allocator shares its process budget;
    /// `config.allocator` is ignored.
    pub fn with_allocator<R>(
        config: &HostConfig,
        allocator: BufferAllocator,
        transport: Arc<dyn Transport>,
        realms: R,
    ) -> Result<Self>
    where
        R: RealmFactory + 'static,
    {
        Ok(Self {
            allocator,
            bridge: Arc::new(CancellationBridge::new(config.bridge.clone(), transport)?),
            policy: Arc::new(config.sandbox.clone()),
            realms: Box::new(realms),
        })
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    pub fn bridge(&self) -> &Arc<CancellationBridge> {
        &self.bridge
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Build a context and seal its realm
    pub fn create(&self) -> Result<ExecutionContext> {
        let id = ContextId::new();
        let mut realm = self.realms.create_realm()?;
        let baseline = capability::apply(realm.as_mut(), &self.policy).map_err(|e| {
            events::sandbox_violation(id, INITIAL_GENERATION, &e.to_string());
            e
        })?;
        events::sandbox_applied(id, baseline.removed_globals.len(), baseline.severed_edges);

        get_metrics().contexts_created.inc();
        events::context_created(id);
        info!("Created execution context {}", id);

        Ok(ExecutionContext {
            id,
            generation: INITIAL_GENERATION,
            realm,
            baseline,
            policy: Arc::clone(&self.policy),
            registry: BlobRegistry::new(id),
            allocations: ContextAllocations::new(id, self.allocator.clone()),
            bridge: Arc::clone(&self.bridge),
            outstanding: Vec::new(),
            queue: EventQueue::new(),
            heap: ScriptHeap::new(),
            lend_count: 0,
            error_count: 0,
            created_at: Utc::now(),
            last_lent: None,
        })
    }
}

/// Point-in-time summary of a context, for reports and the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub generation: Generation,
    pub lend_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_lent: Option<DateTime<Utc>>,
}

pub struct ExecutionContext {
    pub(crate) id: ContextId,
    pub(crate) generation: Generation,
    pub(crate) realm: Box<dyn ScriptRealm>,
    pub(crate) baseline: SealedBaseline,
    pub(crate) policy: Arc<SandboxPolicy>,
    pub(crate) registry: BlobRegistry,
    pub(crate) allocations: ContextAllocations,
    pub(crate) bridge: Arc<CancellationBridge>,
    pub(crate) outstanding: Vec<CancellationHandle>,
    pub(crate) queue: EventQueue,
    pub(crate) heap: ScriptHeap,
    pub(crate) lend_count: u64,
    pub(crate) error_count: u64,
    pub(crate) last_lent: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("lend_count", &self.lend_count)
            .field("error_count", &self.error_count)
            .field("outstanding", &self.outstanding.len())
            .field("blobs", &self.registry.len())
            .finish()
    }
}

impl ExecutionContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn lend_count(&self) -> u64 {
        self.lend_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            generation: self.generation,
            lend_count: self.lend_count,
            error_count: self.error_count,
            created_at: self.created_at,
            last_lent: self.last_lent,
        }
    }

    pub fn baseline(&self) -> &SealedBaseline {
        &self.baseline
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn realm(&self) -> &dyn ScriptRealm {
        self.realm.as_ref()
    }

    /// Script code runs against this; anything it does to shared built-ins is
    /// caught by the post-reset verification.
    pub fn realm_mut(&mut self) -> &mut dyn ScriptRealm {
        self.realm.as_mut()
    }

    /// `typeof name` inside this context
    pub fn typeof_global(&self, name: &str) -> &'static str {
        capability::typeof_global(self.realm.as_ref(), name)
    }

    pub fn heap(&self) -> &ScriptHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ScriptHeap {
        &mut self.heap
    }

    pub fn registry(&self) -> &BlobRegistry {
        &self.registry
    }

    pub fn allocations(&self) -> &ContextAllocations {
        &self.allocations
    }

    /// Allocate a native buffer charged to this context
    pub fn allocate_buffer(&self, size: usize, hint: AllocationHint) -> Result<BufferRef> {
        self.allocations.allocate(size, hint)
    }

    /// Copy script bytes into a buffer charged to this context, so blob
    /// payloads pass the same admission gate as explicit allocations.
    fn admit_bytes(&self, bytes: &[u8]) -> Result<BlobPayload> {
        let buffer = self.allocations.allocate(bytes.len(), AllocationHint::Auto)?;
        buffer.write(0, bytes)?;
        Ok(BlobPayload::Buffer(buffer))
    }

    pub fn create_blob(&mut self, bytes: &[u8], mime_type: &str) -> Result<BlobToken> {
        let payload = self.admit_bytes(bytes)?;
        Ok(self.registry.create(payload, mime_type))
    }

    /// Register a blob backed by a buffer; the registry takes its own reference
    pub fn create_blob_from_buffer(&mut self, buffer: &BufferRef, mime_type: &str) -> Result<BlobToken> {
        let shared = buffer.share()?;
        Ok(self.registry.create(BlobPayload::Buffer(shared), mime_type))
    }

    pub fn create_file(
        &mut self,
        bytes: &[u8],
        mime_type: &str,
        name: &str,
        last_modified: Option<u64>,
    ) -> Result<BlobToken> {
        let payload = self.admit_bytes(bytes)?;
        Ok(self.registry.create_file(payload, mime_type, name, last_modified))
    }

    pub fn resolve_blob(&self, token: &BlobToken) -> Result<BlobEntryView> {
        self.registry.resolve(token)
    }

    pub fn slice_blob(
        &mut self,
        token: &BlobToken,
        start: usize,
        end: usize,
        mime_type: Option<&str>,
    ) -> Result<BlobToken> {
        self.registry.slice(token, start, end, mime_type)
    }

    pub fn revoke_blob(&mut self, token: &BlobToken) {
        self.registry.revoke(token)
    }

    fn track(&mut self, handle: &CancellationHandle) {
        if self.outstanding.len() >= OUTSTANDING_PRUNE_THRESHOLD {
            self.outstanding
                .retain(|h| !(h.is_terminal() && h.wait_settled(Duration::ZERO)));
        }
        self.outstanding.push(handle.clone());
    }

    /// Start a cancellable fetch under the bridge's default timeout
    pub fn fetch(&mut self, request: Request) -> CancellationHandle {
        let timeout = self.bridge.config().default_timeout();
        let handle = self.bridge.prepare(self.id, self.queue.sender(), request);
        self.track(&handle);
        self.bridge.launch(&handle, timeout);
        debug!("Context {} started operation {}", self.id, handle.id());
        handle
    }

    /// Start a cancellable fetch with an explicit hard timeout
    pub fn fetch_with_timeout(&mut self, request: Request, timeout: Duration) -> CancellationHandle {
        let handle = self.bridge.prepare(self.id, self.queue.sender(), request);
        self.track(&handle);
        self.bridge.launch(&handle, Some(timeout));
        handle
    }

    /// Create an operation without dispatching it; see [`Self::launch`]
    pub fn prepare_fetch(&mut self, request: Request) -> CancellationHandle {
        let handle = self.bridge.prepare(self.id, self.queue.sender(), request);
        self.track(&handle);
        handle
    }

    pub fn launch(&self, handle: &CancellationHandle) {
        self.bridge.launch(handle, self.bridge.config().default_timeout());
    }

    /// Operations started in this lending that have not settled yet
    pub fn pending_operations(&self) -> usize {
        self.outstanding.iter().filter(|h| !h.is_terminal()).count()
    }

    pub fn try_next_event(&self) -> Option<ContextEvent> {
        self.queue.try_next()
    }

    pub fn next_event(&self, timeout: Duration) -> Option<ContextEvent> {
        self.queue.next_timeout(timeout)
    }

    /// Final teardown before the context is dropped for good: nothing it
    /// started may keep a connection or a buffer alive.
    pub(crate) fn retire(&mut self) {
        let aborted = self
            .outstanding
            .drain(..)
            .filter(|h| h.abort(AbortReason::ContextRecycled))
            .count();
        self.heap.clear();
        let leaks = self.allocations.reclaim_leaks();
        debug!(
            "Retired {}: {} operations aborted, {} buffers reclaimed",
            self.id, aborted, leaks.reclaimed_buffers
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::AllocatorConfig;
    use crate::testing::mock_transport::MockTransport;

    fn factory() -> ContextFactory {
        let config = HostConfig {
            allocator: AllocatorConfig {
                inline_threshold_bytes: 1024,
                max_allocation_bytes: 1 << 20,
                process_budget_bytes: 1 << 24,
            },
            ..Default::default()
        };
        ContextFactory::new(&config, Arc::new(MockTransport::new()), StandardRealms).unwrap()
    }

    #[test]
    fn test_heap_reuses_slots_and_finalizes_on_collect() {
        let factory = factory();
        let ctx = factory.create().unwrap();
        let mut heap = ScriptHeap::new();

        let buf = ctx.allocate_buffer(64, AllocationHint::Auto).unwrap();
        let shared = buf.share().unwrap();
        let slot = heap.hold(HeapValue::Buffer(buf));
        assert_eq!(shared.refcount(), 2);

        assert!(heap.collect(slot));
        assert_eq!(shared.refcount(), 1);
        assert!(!heap.collect(slot));

        let again = heap.hold(HeapValue::Blob(BlobToken::from_string("blob:x")));
        assert_eq!(again, slot);
        assert_eq!(heap.clear(), 1);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_new_context_is_sealed() {
        let factory = factory();
        let ctx = factory.create().unwrap();
        assert_eq!(ctx.generation(), INITIAL_GENERATION);
        assert_eq!(ctx.typeof_global("eval"), "undefined");
        assert_eq!(ctx.typeof_global("Function"), "undefined");
        assert!(capability::verify(ctx.realm(), ctx.policy(), ctx.baseline()).is_ok());
    }

    #[test]
    fn test_blob_from_buffer_holds_reference() {
        let factory = factory();
        let mut ctx = factory.create().unwrap();
        let buf = ctx.allocate_buffer(32, AllocationHint::Auto).unwrap();
        buf.write(0, b"payload").unwrap();

        let token = ctx.create_blob_from_buffer(&buf, "application/octet-stream").unwrap();
        assert!(buf.dispose());
        let view = ctx.resolve_blob(&token).unwrap();
        assert_eq!(&view.payload.to_vec().unwrap()[..7], b"payload");
    }

    #[test]
    fn test_fetch_completes_through_queue() {
        let factory = factory();
        let mut ctx = factory.create().unwrap();
        let handle = ctx.fetch(Request::get("mock://anything"));

        match ctx.next_event(Duration::from_secs(5)) {
            Some(ContextEvent::Completion(done)) => {
                assert_eq!(done.operation_id, handle.id());
                assert_eq!(done.outcome.into_result().unwrap().body, b"ok");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(ctx.pending_operations(), 0);
    }
}
