/// Storage backing for native buffers
///
/// Small buffers live on the process heap. Large buffers get their own
/// anonymous private mapping so they never fragment the heap and are returned
/// to the OS as soon as the last reference goes away.
use crate::config::types::{HostError, Result};
use log::{debug, error};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Which backing path an allocation took
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingKind {
    #[serde(rename = "inline")]
    Inline,
    #[serde(rename = "mapped")]
    Mapped,
}

/// Anonymous private memory mapping, unmapped on drop
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory owned exclusively by this value; all access goes
// through &self/&mut self.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` zeroed bytes
    pub fn map(len: usize) -> Result<Self> {
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            HostError::Config("cannot map a zero-length region".to_string())
        })?;

        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(|e| HostError::ResourceExhausted {
            requested: len,
            detail: format!("mmap failed: {}", e),
        })?;

        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| HostError::ResourceExhausted {
            requested: len,
            detail: "mmap returned null".to_string(),
        })?;

        debug!("Mapped {} bytes at {:p}", len, ptr);
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let rc = unsafe { munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        match rc {
            Ok(()) => debug!("Unmapped {} bytes at {:p}", self.len, self.ptr),
            Err(e) => error!("munmap of {} bytes at {:p} failed: {}", self.len, self.ptr, e),
        }
    }
}

/// Owned storage behind one allocation record
#[derive(Debug)]
pub enum Backing {
    Inline(Box<[u8]>),
    Mapped(MappedRegion),
}

impl Backing {
    /// Allocate zeroed storage of the requested kind
    pub fn new(kind: BackingKind, size: usize) -> Result<Self> {
        match kind {
            BackingKind::Inline => {
                let mut bytes = Vec::new();
                bytes
                    .try_reserve_exact(size)
                    .map_err(|e| HostError::ResourceExhausted {
                        requested: size,
                        detail: format!("heap commit failed: {}", e),
                    })?;
                bytes.resize(size, 0);
                Ok(Backing::Inline(bytes.into_boxed_slice()))
            }
            BackingKind::Mapped => MappedRegion::map(size).map(Backing::Mapped),
        }
    }

    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::Inline(_) => BackingKind::Inline,
            Backing::Mapped(_) => BackingKind::Mapped,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Inline(bytes) => bytes,
            Backing::Mapped(region) => region.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Inline(bytes) => bytes,
            Backing::Mapped(region) => region.as_mut_slice(),
        }
    }
}

/// System page size, used to report the real footprint of mapped buffers
pub fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_region_is_zeroed_and_writable() {
        let mut region = MappedRegion::map(3 * page_size() + 17).unwrap();
        assert!(region.as_slice().iter().all(|b| *b == 0));

        region.as_mut_slice()[0] = 0xAB;
        let last = region.len() - 1;
        region.as_mut_slice()[last] = 0xCD;
        assert_eq!(region.as_slice()[0], 0xAB);
        assert_eq!(region.as_slice()[last], 0xCD);
    }

    #[test]
    fn test_zero_length_map_rejected() {
        assert!(MappedRegion::map(0).is_err());
    }

    #[test]
    fn test_inline_commit_failure_is_refusal() {
        let err = Backing::new(BackingKind::Inline, usize::MAX).unwrap_err();
        assert!(matches!(err, HostError::ResourceExhausted { requested, .. } if requested == usize::MAX));
    }

    #[test]
    fn test_backing_kinds() {
        let inline = Backing::new(BackingKind::Inline, 16).unwrap();
        assert_eq!(inline.kind(), BackingKind::Inline);
        assert_eq!(inline.as_slice().len(), 16);

        let mapped = Backing::new(BackingKind::Mapped, 16).unwrap();
        assert_eq!(mapped.kind(), BackingKind::Mapped);
        assert_eq!(mapped.as_slice().len(), 16);
    }
}
