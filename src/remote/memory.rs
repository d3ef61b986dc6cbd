//! In-memory remote storage
//!
//! Keeps a whole account in memory and honours the [`RemoteStorage`]
//! contract, including descriptor positions. Every call is counted, failures
//! can be queued per operation, and an artificial latency can be added so
//! concurrent callers overlap.

use super::{
    EntryKind, Fd, FolderListing, Metadata, OpenFlags, OpenTarget, OpenedFile, RemoteError,
    RemoteResult, RemoteStorage, ROOT_FOLDER_ID,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Remote operations, used for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    ListFolder,
    Open,
    Pread,
    Seek,
    Write,
    Truncate,
    Close,
    DeleteFile,
    DeleteFolder,
    Stat,
}

const OP_COUNT: usize = 10;

/// Largest file the in-memory account will hold
const MAX_FILE_SIZE: u64 = 1 << 32;

impl RemoteOp {
    fn index(self) -> usize {
        self as usize
    }
}

/// Snapshot of per-operation call counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list_folder: usize,
    pub open: usize,
    pub pread: usize,
    pub seek: usize,
    pub write: usize,
    pub truncate: usize,
    pub close: usize,
    pub delete_file: usize,
    pub delete_folder: usize,
    pub stat: usize,
}

impl CallCounts {
    /// Sum of all calls
    pub fn total(&self) -> usize {
        self.list_folder
            + self.open
            + self.pread
            + self.seek
            + self.write
            + self.truncate
            + self.close
            + self.delete_file
            + self.delete_folder
            + self.stat
    }
}

struct FolderRecord {
    name: String,
    parent: u64,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

struct FileRecord {
    name: String,
    parent: u64,
    data: Vec<u8>,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

struct Descriptor {
    file_id: u64,
    flags: OpenFlags,
    position: u64,
}

struct Account {
    folders: HashMap<u64, FolderRecord>,
    files: HashMap<u64, FileRecord>,
    descriptors: HashMap<u64, Descriptor>,
    next_folder_id: u64,
    next_file_id: u64,
    next_fd: u64,
}

impl Account {
    fn new() -> Self {
        let now = Utc::now();
        let mut folders = HashMap::new();
        folders.insert(
            ROOT_FOLDER_ID,
            FolderRecord {
                name: "/".to_string(),
                parent: ROOT_FOLDER_ID,
                created: now,
                modified: now,
            },
        );

        Account {
            folders,
            files: HashMap::new(),
            descriptors: HashMap::new(),
            next_folder_id: 100,
            next_file_id: 1000,
            next_fd: 1,
        }
    }

    fn folder_metadata(&self, id: u64) -> Option<Metadata> {
        self.folders.get(&id).map(|f| Metadata {
            name: f.name.clone(),
            kind: EntryKind::Folder,
            id,
            parent_folder_id: f.parent,
            size: 0,
            created: f.created,
            modified: f.modified,
        })
    }

    fn file_metadata(&self, id: u64) -> Option<Metadata> {
        self.files.get(&id).map(|f| Metadata {
            name: f.name.clone(),
            kind: EntryKind::File,
            id,
            parent_folder_id: f.parent,
            size: f.data.len() as u64,
            created: f.created,
            modified: f.modified,
        })
    }

    fn name_taken(&self, parent: u64, name: &str) -> bool {
        self.folders
            .iter()
            .any(|(id, f)| *id != ROOT_FOLDER_ID && f.parent == parent && f.name == name)
            || self.files.values().any(|f| f.parent == parent && f.name == name)
    }

    fn file_by_name(&self, parent: u64, name: &str) -> Option<u64> {
        self.files
            .iter()
            .find(|(_, f)| f.parent == parent && f.name == name)
            .map(|(id, _)| *id)
    }

    fn descriptor(&mut self, fd: Fd) -> RemoteResult<&mut Descriptor> {
        self.descriptors
            .get_mut(&fd.0)
            .ok_or(RemoteError::BadDescriptor(fd.0))
    }
}

/// In-memory [`RemoteStorage`] implementation
pub struct MemoryRemote {
    account: Mutex<Account>,
    calls: [AtomicUsize; OP_COUNT],
    failures: Mutex<HashMap<RemoteOp, VecDeque<RemoteError>>>,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty account containing only the root folder
    pub fn new() -> Self {
        MemoryRemote {
            account: Mutex::new(Account::new()),
            calls: Default::default(),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
        }
    }

    /// Add a folder, returning its id
    pub fn add_folder(&self, parent: u64, name: &str) -> u64 {
        let mut account = self.account.lock();
        let id = account.next_folder_id;
        account.next_folder_id += 1;
        let now = Utc::now();
        account.folders.insert(
            id,
            FolderRecord {
                name: name.to_string(),
                parent,
                created: now,
                modified: now,
            },
        );
        id
    }

    /// Add a file with the given contents, returning its id
    pub fn add_file(&self, parent: u64, name: &str, data: &[u8]) -> u64 {
        let mut account = self.account.lock();
        let id = account.next_file_id;
        account.next_file_id += 1;
        let now = Utc::now();
        account.files.insert(
            id,
            FileRecord {
                name: name.to_string(),
                parent,
                data: data.to_vec(),
                created: now,
                modified: now,
            },
        );
        id
    }

    /// Remove a file behind the filesystem's back
    pub fn remove_file(&self, file_id: u64) -> bool {
        self.account.lock().files.remove(&file_id).is_some()
    }

    /// Current contents of a file
    pub fn file_contents(&self, file_id: u64) -> Option<Vec<u8>> {
        self.account.lock().files.get(&file_id).map(|f| f.data.clone())
    }

    /// Metadata of a file or folder, without counting a call
    pub fn metadata(&self, id: u64) -> Option<Metadata> {
        let account = self.account.lock();
        account
            .file_metadata(id)
            .or_else(|| account.folder_metadata(id))
    }

    /// Number of descriptors currently open
    pub fn open_descriptors(&self) -> usize {
        self.account.lock().descriptors.len()
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: RemoteOp, err: RemoteError) {
        self.failures.lock().entry(op).or_default().push_back(err);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Snapshot of call counts
    pub fn calls(&self) -> CallCounts {
        let get = |op: RemoteOp| self.calls[op.index()].load(Ordering::SeqCst);
        CallCounts {
            list_folder: get(RemoteOp::ListFolder),
            open: get(RemoteOp::Open),
            pread: get(RemoteOp::Pread),
            seek: get(RemoteOp::Seek),
            write: get(RemoteOp::Write),
            truncate: get(RemoteOp::Truncate),
            close: get(RemoteOp::Close),
            delete_file: get(RemoteOp::DeleteFile),
            delete_folder: get(RemoteOp::DeleteFolder),
            stat: get(RemoteOp::Stat),
        }
    }

    /// Count the call, apply latency and any queued failure
    async fn enter(&self, op: RemoteOp) -> RemoteResult<()> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let injected = self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match injected {
            Some(err) => {
                debug!("memory remote: injected failure for {:?}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn list_folder(&self, folder_id: u64) -> RemoteResult<FolderListing> {
        self.enter(RemoteOp::ListFolder).await?;
        let account = self.account.lock();

        let metadata = account
            .folder_metadata(folder_id)
            .ok_or_else(|| RemoteError::NotFound(format!("folder {}", folder_id)))?;

        let mut contents: Vec<Metadata> = account
            .folders
            .iter()
            .filter(|(id, f)| **id != ROOT_FOLDER_ID && f.parent == folder_id)
            .filter_map(|(id, _)| account.folder_metadata(*id))
            .collect();
        contents.extend(
            account
                .files
                .iter()
                .filter(|(_, f)| f.parent == folder_id)
                .filter_map(|(id, _)| account.file_metadata(*id)),
        );

        Ok(FolderListing { metadata, contents })
    }

    async fn open(&self, flags: OpenFlags, target: OpenTarget) -> RemoteResult<OpenedFile> {
        self.enter(RemoteOp::Open).await?;
        let mut account = self.account.lock();

        let file_id = match target {
            OpenTarget::File(id) => {
                if !account.files.contains_key(&id) {
                    return Err(RemoteError::NotFound(format!("file {}", id)));
                }
                id
            }
            OpenTarget::Path { folder_id, name } => {
                if !account.folders.contains_key(&folder_id) {
                    return Err(RemoteError::NotFound(format!("folder {}", folder_id)));
                }
                match account.file_by_name(folder_id, &name) {
                    Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                        return Err(RemoteError::AlreadyExists(name));
                    }
                    Some(id) => id,
                    None if flags.contains(OpenFlags::CREAT) => {
                        if account.name_taken(folder_id, &name) {
                            return Err(RemoteError::AlreadyExists(name));
                        }
                        let id = account.next_file_id;
                        account.next_file_id += 1;
                        let now = Utc::now();
                        account.files.insert(
                            id,
                            FileRecord {
                                name,
                                parent: folder_id,
                                data: Vec::new(),
                                created: now,
                                modified: now,
                            },
                        );
                        if let Some(parent) = account.folders.get_mut(&folder_id) {
                            parent.modified = now;
                        }
                        id
                    }
                    None => return Err(RemoteError::NotFound(name)),
                }
            }
        };

        if flags.contains(OpenFlags::TRUNC | OpenFlags::WRITE) {
            if let Some(file) = account.files.get_mut(&file_id) {
                file.data.clear();
                file.modified = Utc::now();
            }
        }

        let fd = account.next_fd;
        account.next_fd += 1;
        account.descriptors.insert(
            fd,
            Descriptor {
                file_id,
                flags,
                position: 0,
            },
        );

        Ok(OpenedFile {
            fd: Fd(fd),
            file_id,
        })
    }

    async fn pread(&self, fd: Fd, size: u64, offset: u64) -> RemoteResult<Bytes> {
        self.enter(RemoteOp::Pread).await?;
        let mut account = self.account.lock();
        let file_id = account.descriptor(fd)?.file_id;
        let file = account
            .files
            .get(&file_id)
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))?;

        let len = file.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(size).min(len) as usize;
        Ok(Bytes::copy_from_slice(&file.data[start..end]))
    }

    async fn seek(&self, fd: Fd, offset: u64) -> RemoteResult<u64> {
        self.enter(RemoteOp::Seek).await?;
        let mut account = self.account.lock();
        let descriptor = account.descriptor(fd)?;
        descriptor.position = offset;
        Ok(offset)
    }

    async fn write(&self, fd: Fd, data: &[u8]) -> RemoteResult<u64> {
        self.enter(RemoteOp::Write).await?;
        let mut account = self.account.lock();
        let descriptor = account.descriptor(fd)?;
        if !descriptor.flags.contains(OpenFlags::WRITE) {
            return Err(RemoteError::AccessDenied(format!("descriptor {} is read-only", fd.0)));
        }
        let (file_id, append, position) = (
            descriptor.file_id,
            descriptor.flags.contains(OpenFlags::APPEND),
            descriptor.position,
        );

        let file = account
            .files
            .get_mut(&file_id)
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))?;
        let start = if append { file.data.len() as u64 } else { position };
        let end = start
            .checked_add(data.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(RemoteError::TooLarge(start.saturating_add(data.len() as u64)))?;
        let (start, end) = (start as usize, end as usize);
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        file.modified = Utc::now();

        account.descriptor(fd)?.position = end as u64;
        Ok(data.len() as u64)
    }

    async fn truncate(&self, fd: Fd, length: u64) -> RemoteResult<()> {
        self.enter(RemoteOp::Truncate).await?;
        let mut account = self.account.lock();
        let descriptor = account.descriptor(fd)?;
        if !descriptor.flags.contains(OpenFlags::WRITE) {
            return Err(RemoteError::AccessDenied(format!("descriptor {} is read-only", fd.0)));
        }
        if length > MAX_FILE_SIZE {
            return Err(RemoteError::TooLarge(length));
        }
        let file_id = descriptor.file_id;
        let file = account
            .files
            .get_mut(&file_id)
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))?;
        file.data.resize(length as usize, 0);
        file.modified = Utc::now();
        Ok(())
    }

    async fn close(&self, fd: Fd) -> RemoteResult<()> {
        self.enter(RemoteOp::Close).await?;
        self.account
            .lock()
            .descriptors
            .remove(&fd.0)
            .map(|_| ())
            .ok_or(RemoteError::BadDescriptor(fd.0))
    }

    async fn delete_file(&self, file_id: u64) -> RemoteResult<()> {
        self.enter(RemoteOp::DeleteFile).await?;
        self.account
            .lock()
            .files
            .remove(&file_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))
    }

    async fn delete_folder(&self, folder_id: u64) -> RemoteResult<()> {
        self.enter(RemoteOp::DeleteFolder).await?;
        let mut account = self.account.lock();
        if folder_id == ROOT_FOLDER_ID {
            return Err(RemoteError::AccessDenied("cannot delete the root folder".to_string()));
        }
        if !account.folders.contains_key(&folder_id) {
            return Err(RemoteError::NotFound(format!("folder {}", folder_id)));
        }
        let has_children = account.folders.values().any(|f| f.parent == folder_id)
            || account.files.values().any(|f| f.parent == folder_id);
        if has_children {
            return Err(RemoteError::NotEmpty(format!("folder {}", folder_id)));
        }
        account.folders.remove(&folder_id);
        Ok(())
    }

    async fn stat(&self, file_id: u64) -> RemoteResult<Metadata> {
        self.enter(RemoteOp::Stat).await?;
        self.account
            .lock()
            .file_metadata(file_id)
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))
    }
}
