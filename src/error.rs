//! Error types for the snapshot engine.

use std::io;
use thiserror::Error;

/// The error kinds surfaced across the registry, epoch, journal and
/// activation paths.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("access denied")]
    AccessDenied,

    #[error("device not found")]
    NotFound,

    #[error("device already registered")]
    AlreadyRegistered,

    #[error("service is shutting down")]
    ServiceShuttingDown,

    #[error("out of memory")]
    OutOfMemory,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend I/O error: {0}")]
    BackendIo(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
