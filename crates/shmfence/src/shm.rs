//! Mapped fence

use crate::alloc::Handle;
use crate::state::{FenceCell, FenceState, FENCE_SIZE};
use crate::wait::Futex;
use crate::{Error, Result};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use std::io;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::ptr::{self, NonNull};

const MAP_LEN: NonZeroUsize = match NonZeroUsize::new(FENCE_SIZE) {
    Some(len) => len,
    None => panic!("fence cell must not be zero-sized"),
};

/// A fence mapped into this process
///
/// Owns both the mapping and the storage handle. Any number of fences,
/// in this or other processes, may map the same storage; they all see one
/// state. Dropping unmaps and closes the handle.
#[derive(Debug)]
pub struct Fence {
    cell: NonNull<FenceCell>,
    handle: Handle,
}

// Safety: the mapping is only accessed through the atomic word in FenceCell
unsafe impl Send for Fence {}
unsafe impl Sync for Fence {}

impl Fence {
    /// Map fence storage
    ///
    /// Storage smaller than one fence is rejected, since touching a mapping
    /// past the end of its file raises SIGBUS. On failure the handle is
    /// closed.
    pub fn map(handle: Handle) -> Result<Self> {
        let stat = fstat(handle.as_raw_fd()).map_err(|e| Error::Mapping(e.into()))?;
        if stat.st_size < FENCE_SIZE as libc::off_t {
            tracing::debug!(fd = handle.as_raw_fd(), size = stat.st_size, "fence storage too small");
            return Err(Error::Mapping(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fence storage is {} bytes, need {}", stat.st_size, FENCE_SIZE),
            )));
        }

        // SAFETY: fresh shared mapping at a kernel-chosen address; no existing
        // memory is replaced.
        let addr = unsafe {
            mmap(
                None,
                MAP_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &handle,
                0,
            )
        }
        .map_err(|e| {
            tracing::debug!(fd = handle.as_raw_fd(), error = %e, "fence mapping failed");
            Error::Mapping(e.into())
        })?;

        tracing::trace!(fd = handle.as_raw_fd(), ?addr, "fence mapped");
        Ok(Self {
            cell: addr.cast(),
            handle,
        })
    }

    /// Allocate fresh storage and map it
    pub fn create() -> Result<Self> {
        Self::map(crate::alloc::allocate()?)
    }

    /// Unmap, handing back the still-open storage handle
    pub fn unmap(self) -> Handle {
        let mut this = ManuallyDrop::new(self);
        this.release_mapping();
        // SAFETY: `this` is never dropped, so the handle is moved out exactly once
        unsafe { ptr::read(&this.handle) }
    }

    /// Storage handle, e.g. to duplicate and pass to another process
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The shared word, for use with another [`crate::WaitPrimitive`]
    pub fn cell(&self) -> &FenceCell {
        // SAFETY: the mapping lives as long as self and is FENCE_SIZE bytes,
        // page aligned
        unsafe { self.cell.as_ref() }
    }

    /// Trigger the fence, waking all waiters
    pub fn trigger(&self) -> Result<()> {
        self.cell().trigger(&Futex)
    }

    /// Block until the fence is triggered
    pub fn wait(&self) -> Result<()> {
        self.cell().wait(&Futex)
    }

    /// Whether the fence is triggered
    pub fn query(&self) -> bool {
        self.cell().query()
    }

    /// Untrigger the fence
    pub fn reset(&self) {
        self.cell().reset()
    }

    /// Current state
    pub fn state(&self) -> Option<FenceState> {
        self.cell().state()
    }

    fn release_mapping(&mut self) {
        // SAFETY: cell came from mmap with MAP_LEN and is not used afterwards
        if let Err(e) = unsafe { munmap(self.cell.cast(), FENCE_SIZE) } {
            tracing::warn!(error = %e, "fence munmap failed");
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.release_mapping();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocate;

    #[test]
    fn test_fresh_fence_is_unset() {
        let fence = Fence::create().unwrap();
        assert_eq!(fence.state(), Some(FenceState::Unset));
        assert!(!fence.query());
    }

    #[test]
    fn test_two_mappings_share_state() {
        let handle = allocate().unwrap();
        let a = Fence::map(handle.try_clone().unwrap()).unwrap();
        let b = Fence::map(handle).unwrap();

        a.trigger().unwrap();
        assert!(b.query());

        b.reset();
        assert!(!a.query());
    }

    #[test]
    fn test_unmap_returns_usable_handle() {
        let fence = Fence::create().unwrap();
        fence.trigger().unwrap();

        let handle = fence.unmap();
        let again = Fence::map(handle).unwrap();
        assert_eq!(again.state(), Some(FenceState::Set));
    }

    #[test]
    fn test_map_unsized_storage_fails() {
        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

        let fd = memfd_create(c"unsized", MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let err = Fence::map(Handle::from(fd)).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
        assert_eq!(err.io_error().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_map_short_storage_fails() {
        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

        let fd = memfd_create(c"short", MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        nix::unistd::ftruncate(&fd, (FENCE_SIZE - 1) as libc::off_t).unwrap();
        assert!(matches!(Fence::map(Handle::from(fd)), Err(Error::Mapping(_))));
    }

    #[test]
    fn test_map_unmappable_handle_fails() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let err = Fence::map(Handle::from(read_end)).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }
}
