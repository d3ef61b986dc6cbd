//! Remote storage boundary
//!
//! The filesystem talks to the cloud account exclusively through the
//! [`RemoteStorage`] trait. Calls are already authenticated; each one is a
//! single round trip returning structured metadata.

mod memory;

pub use memory::{CallCounts, MemoryRemote, RemoteOp};

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Folder id of the account root
pub const ROOT_FOLDER_ID: u64 = 0;

/// Result type for remote calls
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Errors reported by the remote storage service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("folder not empty: {0}")]
    NotEmpty(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid file descriptor: {0}")]
    BadDescriptor(u64),

    #[error("file would exceed the maximum size: {0} bytes")]
    TooLarge(u64),

    #[error("api error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            RemoteError::NotFound(_) => libc::ENOENT,
            RemoteError::AlreadyExists(_) => libc::EEXIST,
            RemoteError::NotEmpty(_) => libc::ENOTEMPTY,
            RemoteError::AccessDenied(_) => libc::EACCES,
            RemoteError::BadDescriptor(_) => libc::EBADF,
            RemoteError::TooLarge(_) => libc::EFBIG,
            RemoteError::Api { .. } | RemoteError::Transport(_) => libc::EIO,
        }
    }
}

bitflags! {
    /// Open mode flags understood by the remote `file_open` call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const WRITE = 0x0002;
        const CREAT = 0x0040;
        const EXCL = 0x0080;
        const TRUNC = 0x0200;
        const APPEND = 0x0400;
    }
}

/// Remote file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u64);

/// Kind of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    File,
}

/// Metadata record for a remote folder or file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Entry name within its parent folder
    pub name: String,
    /// Folder or file
    pub kind: EntryKind,
    /// Folder id for folders, file id for files
    pub id: u64,
    /// Id of the containing folder
    pub parent_folder_id: u64,
    /// Size in bytes (always 0 for folders)
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Metadata {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// Result of a folder listing
#[derive(Debug, Clone)]
pub struct FolderListing {
    /// Metadata of the listed folder itself
    pub metadata: Metadata,
    /// Direct children
    pub contents: Vec<Metadata>,
}

/// What a remote open call refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
    /// An existing file
    File(u64),
    /// A name inside a folder, used together with `CREAT`
    Path { folder_id: u64, name: String },
}

/// Result of a remote open call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedFile {
    pub fd: Fd,
    pub file_id: u64,
}

/// Remote storage client
///
/// Descriptors are stream-like: `write` happens at the descriptor's current
/// position, which `seek` moves. `pread` does not move it.
#[async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// List the direct contents of a folder
    async fn list_folder(&self, folder_id: u64) -> RemoteResult<FolderListing>;

    /// Open (and optionally create) a file
    async fn open(&self, flags: OpenFlags, target: OpenTarget) -> RemoteResult<OpenedFile>;

    /// Read up to `size` bytes at `offset`
    async fn pread(&self, fd: Fd, size: u64, offset: u64) -> RemoteResult<Bytes>;

    /// Move the descriptor position, returning the new position
    async fn seek(&self, fd: Fd, offset: u64) -> RemoteResult<u64>;

    /// Write at the descriptor position, returning the number of bytes written
    async fn write(&self, fd: Fd, data: &[u8]) -> RemoteResult<u64>;

    /// Set the file length
    async fn truncate(&self, fd: Fd, length: u64) -> RemoteResult<()>;

    async fn close(&self, fd: Fd) -> RemoteResult<()>;

    async fn delete_file(&self, file_id: u64) -> RemoteResult<()>;

    /// Delete an empty folder
    async fn delete_folder(&self, folder_id: u64) -> RemoteResult<()>;

    async fn stat(&self, file_id: u64) -> RemoteResult<Metadata>;
}
