//! Error kinds produced by the integrity engine and their mapping to the
//! errno values the FUSE dispatch layer replies with.

use std::fmt;
use std::io;

/// Errors distinguished by the engine.
#[derive(Debug)]
pub enum OverlayError {
    /// Stored digest does not match computed digest.
    Integrity,
    /// Operation forbidden by WORM policy.
    Policy,
    /// A writer handle is already open on this path (see DESIGN.md: concurrent writers).
    Busy,
    /// The host filesystem rejected the call; propagated unchanged.
    Backing(io::Error),
    /// The sidecar store failed to prepare or execute a statement.
    Sidecar(rusqlite::Error),
    /// Requested extended attribute does not exist.
    NoXattr,
    /// Handle or path identifier is no longer valid.
    Stale,
    /// Operation is not implemented by this filesystem.
    NotSupported,
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::Integrity => write!(f, "stored digest does not match backing content"),
            OverlayError::Policy => write!(f, "operation forbidden under WORM policy"),
            OverlayError::Busy => write!(f, "a writer handle is already open on this path"),
            OverlayError::Backing(e) => write!(f, "backing filesystem error: {e}"),
            OverlayError::Sidecar(e) => write!(f, "sidecar store error: {e}"),
            OverlayError::NoXattr => write!(f, "extended attribute not found"),
            OverlayError::Stale => write!(f, "stale handle or path"),
            OverlayError::NotSupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for OverlayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OverlayError::Backing(e) => Some(e),
            OverlayError::Sidecar(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OverlayError {
    fn from(e: io::Error) -> Self {
        OverlayError::Backing(e)
    }
}

impl From<rusqlite::Error> for OverlayError {
    fn from(e: rusqlite::Error) -> Self {
        OverlayError::Sidecar(e)
    }
}

impl OverlayError {
    /// Map to the POSIX errno the FUSE reply carries back to the kernel.
    pub fn to_errno(&self) -> i32 {
        match self {
            OverlayError::Integrity => libc::EIO,
            OverlayError::Policy => libc::EACCES,
            OverlayError::Busy => libc::EAGAIN,
            OverlayError::Backing(e) => e.raw_os_error().unwrap_or(libc::EIO),
            OverlayError::Sidecar(_) => libc::EIO,
            OverlayError::NoXattr => libc::ENODATA,
            OverlayError::Stale => libc::ESTALE,
            OverlayError::NotSupported => libc::ENOSYS,
        }
    }
}

pub type OverlayResult<T> = Result<T, OverlayError>;
