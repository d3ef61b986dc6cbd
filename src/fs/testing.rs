//! Helpers shared by the node tests

use crate::config::MountConfig;
use crate::fs::attr::{AttrPolicy, Owner};
use crate::fs::context::OpContext;
use crate::fs::file::FileNode;
use crate::fs::invalidate::{Invalidator, NoopInvalidator};
use crate::fs::node::FsShared;
use crate::remote::{
    Fd, FolderListing, MemoryRemote, Metadata, OpenFlags, OpenTarget, OpenedFile, RemoteResult,
    RemoteStorage,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct RecordingInvalidator {
    fail: bool,
    calls: Mutex<Vec<u64>>,
}

impl RecordingInvalidator {
    pub(crate) fn new(fail: bool) -> Self {
        RecordingInvalidator {
            fail,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<u64> {
        self.calls.lock().clone()
    }
}

impl Invalidator for RecordingInvalidator {
    fn invalidate_attr(&self, ino: u64) -> io::Result<()> {
        self.calls.lock().push(ino);
        if self.fail {
            Err(io::Error::new(io::ErrorKind::NotConnected, "unmounted"))
        } else {
            Ok(())
        }
    }
}

/// Remote whose `open` takes effect immediately but replies after `delay`
pub(crate) struct SlowOpenRemote {
    inner: Arc<MemoryRemote>,
    delay: Duration,
}

impl SlowOpenRemote {
    pub(crate) fn new(inner: Arc<MemoryRemote>, delay: Duration) -> Self {
        SlowOpenRemote { inner, delay }
    }
}

#[async_trait]
impl RemoteStorage for SlowOpenRemote {
    async fn list_folder(&self, folder_id: u64) -> RemoteResult<FolderListing> {
        self.inner.list_folder(folder_id).await
    }

    async fn open(&self, flags: OpenFlags, target: OpenTarget) -> RemoteResult<OpenedFile> {
        let opened = self.inner.open(flags, target).await?;
        tokio::time::sleep(self.delay).await;
        Ok(opened)
    }

    async fn pread(&self, fd: Fd, size: u64, offset: u64) -> RemoteResult<Bytes> {
        self.inner.pread(fd, size, offset).await
    }

    async fn seek(&self, fd: Fd, offset: u64) -> RemoteResult<u64> {
        self.inner.seek(fd, offset).await
    }

    async fn write(&self, fd: Fd, data: &[u8]) -> RemoteResult<u64> {
        self.inner.write(fd, data).await
    }

    async fn truncate(&self, fd: Fd, length: u64) -> RemoteResult<()> {
        self.inner.truncate(fd, length).await
    }

    async fn close(&self, fd: Fd) -> RemoteResult<()> {
        self.inner.close(fd).await
    }

    async fn delete_file(&self, file_id: u64) -> RemoteResult<()> {
        self.inner.delete_file(file_id).await
    }

    async fn delete_folder(&self, folder_id: u64) -> RemoteResult<()> {
        self.inner.delete_folder(folder_id).await
    }

    async fn stat(&self, file_id: u64) -> RemoteResult<Metadata> {
        self.inner.stat(file_id).await
    }
}

pub(crate) fn policy() -> AttrPolicy {
    AttrPolicy::new(Owner { uid: 1000, gid: 1000 }, &MountConfig::default())
}

pub(crate) fn shared_with(
    remote: Arc<dyn RemoteStorage>,
    writable: bool,
    invalidator: Arc<dyn Invalidator>,
) -> Arc<FsShared> {
    Arc::new(FsShared::new(remote, policy(), writable, invalidator))
}

pub(crate) fn shared(remote: Arc<dyn RemoteStorage>, writable: bool) -> Arc<FsShared> {
    shared_with(remote, writable, Arc::new(NoopInvalidator))
}

pub(crate) fn ctx() -> OpContext {
    OpContext::new(1)
}

pub(crate) async fn file_node(
    shared: &Arc<FsShared>,
    remote: &MemoryRemote,
    file_id: u64,
) -> FileNode {
    let meta = remote.metadata(file_id).unwrap();
    FileNode::from_metadata(shared.clone(), &meta)
}
