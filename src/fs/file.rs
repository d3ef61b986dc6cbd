//! File nodes and their remote descriptor
//!
//! A file node holds at most one remote descriptor. It is opened explicitly
//! by `open` or lazily by the first `read`/`write`, shared by every
//! operation on the node while open, and closed by `flush` or `release`.

use crate::error::{Error, Result};
use crate::fs::attr::NodeAttr;
use crate::fs::context::OpContext;
use crate::fs::flags;
use crate::fs::node::FsShared;
use crate::remote::{Fd, Metadata, OpenFlags, OpenTarget};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Descriptor position is unknown after a failed seek or write
const POSITION_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct OpenHandle {
    fd: Fd,
    flags: OpenFlags,
    position: u64,
}

/// A remote file
pub struct FileNode {
    shared: Arc<FsShared>,
    file_id: u64,
    parent_folder_id: u64,
    attr: RwLock<NodeAttr>,
    /// Held across remote calls so concurrent operations on this node
    /// never open a second descriptor or interleave seek and write.
    handle: Mutex<Option<OpenHandle>>,
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileNode({})", self.file_id)
    }
}

impl FileNode {
    /// Node for a file reported by a listing or a stat
    pub fn from_metadata(shared: Arc<FsShared>, meta: &Metadata) -> Self {
        let attr = shared.policy.file_attr(meta);
        FileNode {
            file_id: meta.id,
            parent_folder_id: meta.parent_folder_id,
            attr: RwLock::new(attr),
            handle: Mutex::new(None),
            shared,
        }
    }

    /// Node for a file that was just created: zero size, timestamps now
    pub fn created(shared: Arc<FsShared>, file_id: u64, parent_folder_id: u64) -> Self {
        let attr = shared.policy.new_file_attr(file_id);
        FileNode {
            file_id,
            parent_folder_id,
            attr: RwLock::new(attr),
            handle: Mutex::new(None),
            shared,
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn parent_folder_id(&self) -> u64 {
        self.parent_folder_id
    }

    pub fn attr(&self) -> NodeAttr {
        self.attr.read().clone()
    }

    pub fn is_fresh(&self) -> bool {
        self.attr.read().is_fresh()
    }

    /// Whether a remote descriptor is currently held
    pub async fn is_open(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Replace cached attributes with fresh remote metadata
    pub fn apply_metadata(&self, meta: &Metadata) {
        *self.attr.write() = self.shared.policy.file_attr(meta);
    }

    /// Re-read attributes from the remote service
    pub async fn refresh(&self, ctx: &OpContext) -> Result<()> {
        let meta = ctx.run(self.shared.remote.stat(self.file_id)).await?;
        self.apply_metadata(&meta);
        Ok(())
    }

    /// Open the remote descriptor. Reuses the current one if already open.
    pub async fn open(&self, open_flags: i32, ctx: &OpContext) -> Result<()> {
        let wanted = self
            .shared
            .restrict(flags::translate(open_flags) - (OpenFlags::CREAT | OpenFlags::EXCL));

        let mut slot = self.handle.lock().await;
        self.ensure_open(&mut slot, wanted, wanted & OpenFlags::WRITE, ctx)
            .await?;
        Ok(())
    }

    /// Read up to `size` bytes at `offset`. Short reads are returned as-is.
    pub async fn read(
        &self,
        size: u32,
        offset: u64,
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<Bytes> {
        if flags::is_write_only(open_flags) {
            return Err(Error::PermissionDenied(format!(
                "file {} is open write-only",
                self.file_id
            )));
        }

        let wanted = self.shared.restrict(flags::reopen(open_flags));
        let mut slot = self.handle.lock().await;
        let handle = self
            .ensure_open(&mut slot, wanted, OpenFlags::empty(), ctx)
            .await?;

        ctx.run(self.shared.remote.pread(handle.fd, u64::from(size), offset))
            .await
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// The cached size is reconciled afterwards; failing to confirm it never
    /// fails the write.
    pub async fn write(
        &self,
        data: &[u8],
        offset: u64,
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<u64> {
        self.shared.ensure_writable()?;
        let wanted = flags::reopen(open_flags) | OpenFlags::WRITE;

        let written = {
            let mut slot = self.handle.lock().await;
            let handle = self
                .ensure_open(&mut slot, wanted, OpenFlags::WRITE, ctx)
                .await?;

            if offset != 0 || handle.position != 0 {
                let fd = handle.fd;
                handle.position = POSITION_UNKNOWN;
                handle.position = ctx.run(self.shared.remote.seek(fd, offset)).await?;
            }

            let fd = handle.fd;
            let start = handle.position;
            handle.position = POSITION_UNKNOWN;
            let written = ctx.run(self.shared.remote.write(fd, data)).await?;
            handle.position = start + written;
            written
        };

        self.reconcile_size(offset, written, ctx).await;
        Ok(written)
    }

    /// Set the file length
    pub async fn truncate(&self, size: u64, ctx: &OpContext) -> Result<()> {
        self.shared.ensure_writable()?;

        let slot = self.handle.lock().await;
        match slot.as_ref() {
            Some(handle) if handle.flags.contains(OpenFlags::WRITE) => {
                ctx.run(self.shared.remote.truncate(handle.fd, size)).await?;
            }
            _ => {
                let opened = self
                    .shared
                    .open_remote(OpenFlags::WRITE, OpenTarget::File(self.file_id), ctx)
                    .await?;
                let result = ctx.run(self.shared.remote.truncate(opened.fd, size)).await;

                let cleanup = ctx.cleanup_scope();
                if let Err(e) = cleanup.run(self.shared.remote.close(opened.fd)).await {
                    warn!(
                        "truncate: failed to close descriptor {} of file {}: {}",
                        opened.fd.0, self.file_id, e
                    );
                }
                result?;
            }
        }
        drop(slot);

        self.attr.write().set_size(size);
        Ok(())
    }

    /// Close the descriptor if one is open
    pub async fn flush(&self, ctx: &OpContext) -> Result<()> {
        self.close_handle("flush", ctx).await
    }

    /// Close the descriptor if one is open
    pub async fn release(&self, ctx: &OpContext) -> Result<()> {
        self.close_handle("release", ctx).await
    }

    async fn close_handle(&self, op: &str, ctx: &OpContext) -> Result<()> {
        let mut slot = self.handle.lock().await;
        match slot.take() {
            Some(handle) => {
                debug!(
                    "{}: closing descriptor {} of file {}",
                    op, handle.fd.0, self.file_id
                );
                ctx.run(self.shared.remote.close(handle.fd)).await
            }
            None => {
                debug!("{}: file {} has no open descriptor", op, self.file_id);
                Ok(())
            }
        }
    }

    /// Return the open descriptor, opening one with `wanted` if needed.
    ///
    /// An open descriptor lacking any of `required` is replaced.
    async fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<OpenHandle>,
        wanted: OpenFlags,
        required: OpenFlags,
        ctx: &OpContext,
    ) -> Result<&'a mut OpenHandle> {
        let reusable = slot
            .as_ref()
            .is_some_and(|handle| handle.flags.contains(required));

        if !reusable {
            if let Some(stale) = slot.take() {
                debug!(
                    "file {}: replacing descriptor {} to gain write access",
                    self.file_id, stale.fd.0
                );
                if let Err(e) = ctx.run(self.shared.remote.close(stale.fd)).await {
                    warn!(
                        "file {}: failed to close descriptor {}: {}",
                        self.file_id, stale.fd.0, e
                    );
                }
            }

            let opened = self
                .shared
                .open_remote(wanted, OpenTarget::File(self.file_id), ctx)
                .await?;
            debug!(
                "file {}: opened descriptor {} (request {})",
                self.file_id,
                opened.fd.0,
                ctx.request_id()
            );

            if wanted.contains(OpenFlags::WRITE | OpenFlags::TRUNC) {
                self.attr.write().set_size(0);
            }

            *slot = Some(OpenHandle {
                fd: opened.fd,
                flags: wanted,
                position: 0,
            });
        }

        slot.as_mut().ok_or_else(|| {
            Error::Internal(format!("file {}: no descriptor after open", self.file_id))
        })
    }

    /// Bring the cached size in line with a completed write
    async fn reconcile_size(&self, offset: u64, written: u64, ctx: &OpContext) {
        if offset == 0 {
            self.attr.write().set_size(written);
            return;
        }

        match ctx.run(self.shared.remote.stat(self.file_id)).await {
            Ok(meta) => self.apply_metadata(&meta),
            Err(e) => {
                warn!(
                    "write: could not confirm size of file {}: {}",
                    self.file_id, e
                );
                self.attr.write().expire();
                if let Err(e) = self.shared.invalidator.invalidate_attr(self.file_id) {
                    warn!(
                        "write: failed to invalidate attributes of file {}: {}",
                        self.file_id, e
                    );
                }
            }
        }
    }
}
