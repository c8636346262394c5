//! Anonymous storage for fences
//!
//! A fence lives in a 4-byte file that has no name in any filesystem. The
//! open descriptor, wrapped in [`Handle`], is the only reference to it; the
//! storage goes away when the last descriptor referring to it is closed.

use crate::state::FENCE_SIZE;
use crate::{Error, Result};
use nix::fcntl::{self, FcntlArg, OFlag, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, AccessFlags};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Directories probed, in order, for file-backed strategies
pub const SHM_DIR_CANDIDATES: &[&str] = &["/dev/shm", "/run/shm", "/var/tmp", "/tmp"];

/// mkstemp template file name (the X's are replaced)
const TEMPLATE_NAME: &str = "shmfd-XXXXXX";

/// Owned descriptor of fence storage
///
/// Transferable to other processes by whatever means the caller chooses
/// (fork inheritance, `SCM_RIGHTS`, ...).
#[derive(Debug)]
pub struct Handle {
    fd: OwnedFd,
}

impl Handle {
    /// Duplicate the descriptor; both refer to the same storage
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Give up the handle, returning the descriptor
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Handle {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl FromRawFd for Handle {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

/// How unnamed storage is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Anonymous memory file (`memfd_create`), sealed against shrinking
    Memfd,
    /// Unnamed file in a directory (`O_TMPFILE`)
    TmpFile,
    /// `mkstemp` in a directory, name unlinked right away
    ///
    /// The unlink is retried once; if that fails too, allocation fails and
    /// the `shmfd-XXXXXX` file is left behind in the directory.
    NamedUnlinked,
}

impl AllocStrategy {
    /// All strategies, most preferred first
    pub const PREFERENCE: [AllocStrategy; 3] = [
        AllocStrategy::Memfd,
        AllocStrategy::TmpFile,
        AllocStrategy::NamedUnlinked,
    ];
}

/// Creates fence storage with a fixed strategy
#[derive(Debug, Clone)]
pub struct Allocator {
    strategy: AllocStrategy,
    dir: PathBuf,
}

impl Allocator {
    /// Allocator with an explicit strategy and directory
    ///
    /// `dir` is unused by [`AllocStrategy::Memfd`].
    pub fn new(strategy: AllocStrategy, dir: impl Into<PathBuf>) -> Self {
        Self {
            strategy,
            dir: dir.into(),
        }
    }

    /// Probe the platform and pick the first strategy that works
    ///
    /// The directory is the first writable entry of [`SHM_DIR_CANDIDATES`].
    /// Each strategy is tried once with a throwaway object.
    pub fn detect() -> Result<Self> {
        let dir = writable_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

        let mut last_err = None;
        for strategy in AllocStrategy::PREFERENCE {
            let allocator = Self::new(strategy, dir.clone());
            match allocator.create() {
                Ok(_probe) => {
                    tracing::debug!(?strategy, dir = %dir.display(), "fence allocation strategy selected");
                    return Ok(allocator);
                }
                Err(e) => {
                    tracing::debug!(?strategy, error = %e, "fence allocation strategy unavailable");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Allocation(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "no allocation strategy")
        })))
    }

    /// Selected strategy
    pub fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    /// Directory used by file-backed strategies
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create storage for one fence, sized and zero-filled (UNSET)
    pub fn allocate(&self) -> Result<Handle> {
        let fd = self.create().map_err(Error::Allocation)?;
        unistd::ftruncate(&fd, FENCE_SIZE as libc::off_t)
            .map_err(|e| Error::Allocation(e.into()))?;
        if self.strategy == AllocStrategy::Memfd {
            // peers mapping this storage must never see it shrink under them
            fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK))
                .map_err(|e| Error::Allocation(e.into()))?;
        }

        tracing::debug!(fd = fd.as_raw_fd(), strategy = ?self.strategy, "fence storage allocated");
        Ok(Handle { fd })
    }

    fn create(&self) -> io::Result<OwnedFd> {
        match self.strategy {
            AllocStrategy::Memfd => Ok(memfd_create(
                c"shmfence",
                MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
            )?),
            AllocStrategy::TmpFile => {
                let fd = fcntl::open(
                    self.dir.as_path(),
                    OFlag::O_TMPFILE | OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_EXCL,
                    Mode::from_bits_truncate(0o666),
                )?;
                // SAFETY: open just returned this descriptor and nothing else owns it
                Ok(unsafe { OwnedFd::from_raw_fd(fd) })
            }
            AllocStrategy::NamedUnlinked => {
                let template = self.dir.join(TEMPLATE_NAME);
                let (fd, path) = unistd::mkstemp(&template)?;
                // SAFETY: mkstemp just returned this descriptor and nothing else owns it
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                if let Err(e) = unistd::unlink(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "unlink of fence storage failed, retrying");
                    unistd::unlink(&path).map_err(|_| e)?;
                }
                Ok(fd)
            }
        }
    }
}

fn writable_dir() -> Option<PathBuf> {
    SHM_DIR_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|dir| unistd::access(*dir, AccessFlags::W_OK | AccessFlags::X_OK).is_ok())
        .map(Path::to_path_buf)
}

/// Allocate fence storage with the platform's best strategy
///
/// The strategy is probed on first successful use and reused afterwards.
pub fn allocate() -> Result<Handle> {
    cached_or_detect(&DEFAULT, Allocator::detect)?.allocate()
}

static DEFAULT: OnceLock<Allocator> = OnceLock::new();

/// Return the cached allocator, running `detect` only while none is cached.
/// A failed detection leaves the cache empty.
fn cached_or_detect(
    cache: &OnceLock<Allocator>,
    detect: impl FnOnce() -> Result<Allocator>,
) -> Result<&Allocator> {
    match cache.get() {
        Some(allocator) => Ok(allocator),
        None => {
            let detected = detect()?;
            Ok(cache.get_or_init(|| detected))
        }
    }
}
