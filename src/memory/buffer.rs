/// Script-visible buffer wrapper
///
/// A `BufferRef` is what a script value holds. Each wrapper owns exactly one
/// reference on its allocation record. The reference is dropped either by an
/// explicit `dispose()` or by the collector's finalizer (`finalize()`, also run
/// on `Drop`); whichever comes first wins and the other is a no-op.
use crate::config::types::{HostError, Result};
use crate::memory::allocator::AllocationRecord;
use crate::memory::backing::BackingKind;
use crate::observability::metrics::get_metrics;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct BufferRef {
    record: Arc<AllocationRecord>,
    /// Start of this view inside the allocation
    offset: usize,
    /// Length of this view
    len: usize,
    disposed: AtomicBool,
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRef")
            .field("id", &self.record.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("kind", &self.record.kind())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(HostError::OutOfBounds { offset, len, size }),
    }
}

impl BufferRef {
    pub(crate) fn from_record(record: Arc<AllocationRecord>) -> Self {
        let len = record.size();
        Self {
            record,
            offset: 0,
            len,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn record(&self) -> &Arc<AllocationRecord> {
        &self.record
    }

    /// Allocation id, shared by every view of the same storage
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.record.kind() == BackingKind::Mapped
    }

    pub fn backing_kind(&self) -> BackingKind {
        self.record.kind()
    }

    pub fn refcount(&self) -> usize {
        self.record.refcount()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the underlying storage has been torn down
    pub fn is_released(&self) -> bool {
        self.record.is_released()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HostError::BufferReleased);
        }
        Ok(())
    }

    /// Run `f` over this view's bytes
    fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        self.ensure_live()?;
        let guard = self.record.storage();
        let backing = guard.as_ref().ok_or(HostError::BufferReleased)?;
        Ok(f(&backing.as_slice()[self.offset..self.offset + self.len]))
    }

    fn with_bytes_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        self.ensure_live()?;
        let mut guard = self.record.storage();
        let backing = guard.as_mut().ok_or(HostError::BufferReleased)?;
        Ok(f(&mut backing.as_mut_slice()[self.offset..self.offset + self.len]))
    }

    /// Copy `len` bytes starting at `offset` out of the buffer
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.len)?;
        self.with_bytes(|bytes| bytes[offset..offset + len].to_vec())
    }

    /// Fill `dst` from the buffer starting at `offset`
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.len)?;
        self.with_bytes(|bytes| dst.copy_from_slice(&bytes[offset..offset + dst.len()]))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_bytes(|bytes| bytes.to_vec())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.len)?;
        self.with_bytes_mut(|bytes| bytes[offset..offset + data.len()].copy_from_slice(data))
    }

    pub fn fill(&self, value: u8) -> Result<()> {
        self.with_bytes_mut(|bytes| bytes.fill(value))
    }

    /// Shared view over `[start, end)`; retains the allocation
    pub fn slice(&self, start: usize, end: usize) -> Result<BufferRef> {
        if start > end {
            return Err(HostError::OutOfBounds {
                offset: start,
                len: 0,
                size: self.len,
            });
        }
        check_range(start, end - start, self.len)?;
        self.ensure_live()?;
        if !self.record.try_retain() {
            return Err(HostError::BufferReleased);
        }
        Ok(BufferRef {
            record: Arc::clone(&self.record),
            offset: self.offset + start,
            len: end - start,
            disposed: AtomicBool::new(false),
        })
    }

    /// Another wrapper over the same view; retains the allocation
    pub fn share(&self) -> Result<BufferRef> {
        self.slice(0, self.len)
    }

    /// Move `len` bytes from `src` to `dst` inside this view (memmove semantics)
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        check_range(src, len, self.len)?;
        check_range(dst, len, self.len)?;
        self.with_bytes_mut(|bytes| bytes.copy_within(src..src + len, dst))
    }

    /// Copy `len` bytes from another buffer into this one
    pub fn copy_from(
        &self,
        dst_offset: usize,
        src: &BufferRef,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        check_range(dst_offset, len, self.len)?;
        if Arc::ptr_eq(&self.record, &src.record) {
            src.ensure_live()?;
            let src_abs = src.offset + src_offset;
            check_range(src_offset, len, src.len)?;
            let dst_abs = self.offset + dst_offset;
            self.ensure_live()?;
            let mut guard = self.record.storage();
            let backing = guard.as_mut().ok_or(HostError::BufferReleased)?;
            backing
                .as_mut_slice()
                .copy_within(src_abs..src_abs + len, dst_abs);
            return Ok(());
        }
        // Distinct records: stage through a temporary so only one storage
        // lock is held at a time.
        let staged = src.read(src_offset, len)?;
        self.write(dst_offset, &staged)
    }

    /// Explicitly drop this wrapper's reference.
    ///
    /// Returns true if this call dropped the reference, false if the wrapper
    /// was already disposed or finalized.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.record.release_ref();
        true
    }

    /// Collector finalizer entry point. Never fails; safe to race with
    /// `dispose` and to call repeatedly.
    pub fn finalize(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.record.release_ref() {
            get_metrics().buffers_finalized.inc();
            debug!("Finalizer reclaimed buffer {}", self.record.id());
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.finalize();
    }
}
