//! shmfence - Cross-process fence in shared memory
//!
//! A fence is one 32-bit word in an anonymous shared segment. One party
//! triggers it, any number of parties in any process mapping the same
//! segment can block until it is triggered, and it can be reset for reuse.
//!
//! ```no_run
//! use shmfence::{allocate, Fence};
//!
//! let handle = allocate()?;
//! let waiter = Fence::map(handle.try_clone()?)?;
//! let signaller = Fence::map(handle)?;
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| waiter.wait());
//!     signaller.trigger()
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod state;
pub mod wait;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod alloc;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod shm;

pub use error::{Error, Result};
pub use state::{FenceCell, FenceState, FENCE_SIZE};
pub use wait::{WaitPrimitive, WaitResult};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use alloc::{allocate, AllocStrategy, Allocator, Handle, SHM_DIR_CANDIDATES};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use shm::Fence;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use wait::Futex;
