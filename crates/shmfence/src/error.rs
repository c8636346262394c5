//! Error types for shmfence

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// No temporary storage could be created or sized for a fence.
    #[error("fence allocation failed: {0}")]
    Allocation(#[source] io::Error),

    /// The fence storage could not be mapped into this process.
    #[error("fence mapping failed: {0}")]
    Mapping(#[source] io::Error),

    /// The wait or wake primitive failed for a non-transient reason.
    #[error("fence wait/wake failed: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    /// Underlying OS error
    pub fn io_error(&self) -> &io::Error {
        match self {
            Error::Allocation(e) | Error::Mapping(e) | Error::Io(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
