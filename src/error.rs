//! Error types for pcloud-drive

use crate::remote::RemoteError;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pcloud-drive
#[derive(Error, Debug)]
pub enum Error {
    // Remote errors
    #[error("Remote call failed: {0}")]
    Remote(#[from] RemoteError),

    // Node errors
    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    // Filesystem errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Filesystem is mounted read-only")]
    ReadOnly,

    // Operation context errors
    #[error("Operation {0} canceled")]
    Canceled(u64),

    #[error("Operation {0} timed out")]
    TimedOut(u64),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Remote(e) => e.to_errno(),
            Error::NotFound(_) | Error::InodeNotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::InvalidName(_) => libc::EINVAL,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::ReadOnly => libc::EROFS,
            Error::Canceled(_) => libc::EINTR,
            Error::TimedOut(_) => libc::ETIMEDOUT,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// True when the error means the remote object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InodeNotFound(_) | Error::Remote(RemoteError::NotFound(_))
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
