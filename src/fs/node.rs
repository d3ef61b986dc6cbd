//! Filesystem nodes and the state they share

use crate::error::{Error, Result};
use crate::fs::attr::{AttrPolicy, NodeAttr, NodeKind};
use crate::fs::context::OpContext;
use crate::fs::dir::DirNode;
use crate::fs::file::FileNode;
use crate::fs::invalidate::Invalidator;
use crate::remote::{OpenFlags, OpenTarget, OpenedFile, RemoteStorage};
use std::sync::Arc;
use tracing::{debug, warn};

/// State shared by every node of one mount, built once at mount time
pub struct FsShared {
    /// Remote storage client
    pub remote: Arc<dyn RemoteStorage>,
    /// Attribute policy (owner, permissions, validity windows)
    pub policy: AttrPolicy,
    /// Whether the write path is enabled
    pub writable: bool,
    /// Kernel attribute invalidation
    pub invalidator: Arc<dyn Invalidator>,
}

impl FsShared {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        policy: AttrPolicy,
        writable: bool,
        invalidator: Arc<dyn Invalidator>,
    ) -> Self {
        FsShared {
            remote,
            policy,
            writable,
            invalidator,
        }
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Open a remote descriptor under `ctx`.
    ///
    /// If the operation is canceled or times out while the open is in
    /// flight, the call is still driven to completion in the cleanup scope
    /// and any descriptor it returns is closed before the error is reported.
    pub async fn open_remote(
        &self,
        flags: OpenFlags,
        target: OpenTarget,
        ctx: &OpContext,
    ) -> Result<OpenedFile> {
        if ctx.is_canceled() {
            return Err(Error::Canceled(ctx.request_id()));
        }

        let mut call = Box::pin(self.remote.open(flags, target));
        let err = match ctx.run(call.as_mut()).await {
            Err(e @ (Error::Canceled(_) | Error::TimedOut(_))) => e,
            other => return other,
        };

        let cleanup = ctx.cleanup_scope();
        match cleanup.run(call).await {
            Ok(opened) => {
                debug!(
                    "request {}: closing descriptor {} opened after {}",
                    ctx.request_id(),
                    opened.fd.0,
                    err
                );
                if let Err(e) = cleanup.run(self.remote.close(opened.fd)).await {
                    warn!(
                        "request {}: failed to close abandoned descriptor {} of file {}: {}",
                        ctx.request_id(),
                        opened.fd.0,
                        opened.file_id,
                        e
                    );
                }
            }
            Err(e @ Error::TimedOut(_)) => {
                warn!(
                    "request {}: abandoned open did not settle: {}",
                    ctx.request_id(),
                    e
                );
            }
            Err(_) => {}
        }
        Err(err)
    }

    /// Drop write capabilities from `flags` on a read-only mount
    pub fn restrict(&self, flags: OpenFlags) -> OpenFlags {
        if self.writable {
            flags
        } else {
            flags - (OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::APPEND)
        }
    }
}

/// A directory or a file
#[derive(Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Node {
    /// Remote identifier, used as inode number
    pub fn ino(&self) -> u64 {
        match self {
            Node::Dir(dir) => dir.folder_id(),
            Node::File(file) => file.file_id(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Dir(_) => NodeKind::Directory,
            Node::File(_) => NodeKind::File,
        }
    }

    pub fn attr(&self) -> NodeAttr {
        match self {
            Node::Dir(dir) => dir.attr(),
            Node::File(file) => file.attr(),
        }
    }

    /// Same node object, not merely the same remote id
    pub fn same(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn into_dir(self, name: &str) -> Result<Arc<DirNode>> {
        match self {
            Node::Dir(dir) => Ok(dir),
            Node::File(_) => Err(Error::NotADirectory(name.to_string())),
        }
    }

    pub fn into_file(self, name: &str) -> Result<Arc<FileNode>> {
        match self {
            Node::File(file) => Ok(file),
            Node::Dir(_) => Err(Error::IsADirectory(name.to_string())),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Dir(dir) => write!(f, "Dir({})", dir.folder_id()),
            Node::File(file) => write!(f, "File({})", file.file_id()),
        }
    }
}
