//! Main FUSE filesystem implementation

use crate::config::{Config, MountConfig};
use crate::error::{Error, Result};
use crate::fs::attr::{AttrPolicy, NodeAttr, NodeKind, Owner, BLOCK_SIZE};
use crate::fs::context::OpContext;
use crate::fs::dir::DirNode;
use crate::fs::file::FileNode;
use crate::fs::flags;
use crate::fs::inode::InodeTable;
use crate::fs::invalidate::Invalidator;
use crate::fs::node::{FsShared, Node};
use crate::remote::{RemoteStorage, ROOT_FOLDER_ID};

use bytes::Bytes;
use fuser::{
    FileType as FuserFileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest name the remote accepts
const NAME_MAX: u32 = 255;

/// Remote cloud drive exposed as a FUSE filesystem
pub struct DriveFs {
    /// State shared with every node
    shared: Arc<FsShared>,
    /// Nodes known to the kernel, including the root
    inodes: InodeTable,
    /// Tokio runtime for async operations
    runtime: Runtime,
    /// Cancelled at unmount; every operation context is a child of it
    shutdown: CancellationToken,
    request_timeout: Option<Duration>,
    cleanup_timeout: Duration,
    max_readahead: u32,
}

impl DriveFs {
    /// Create a filesystem over `remote`, rooted at the account's root folder
    pub fn new(
        config: &Config,
        remote: Arc<dyn RemoteStorage>,
        owner: Owner,
        invalidator: Arc<dyn Invalidator>,
    ) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;

        let policy = AttrPolicy::new(owner, &config.mount);
        let shared = Arc::new(FsShared::new(
            remote,
            policy,
            config.mount.read_write,
            invalidator,
        ));
        let root = Arc::new(DirNode::root(shared.clone(), ROOT_FOLDER_ID));

        Ok(DriveFs {
            shared,
            inodes: InodeTable::new(root),
            runtime,
            shutdown: CancellationToken::new(),
            request_timeout: config.remote.request_timeout(),
            cleanup_timeout: config.remote.cleanup_timeout(),
            max_readahead: config.mount.max_readahead,
        })
    }

    /// Helper to run async code from sync FUSE callbacks
    fn block_on<F: std::future::Future>(&self, f: F) -> F::Output {
        self.runtime.block_on(f)
    }

    /// Context for one kernel request
    fn context(&self, request_id: u64) -> OpContext {
        OpContext::new(request_id)
            .with_token(self.shutdown.child_token())
            .with_timeout(self.request_timeout)
            .with_cleanup_timeout(self.cleanup_timeout)
    }

    /// Cancel every in-flight and future remote call
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn dir(&self, ino: u64) -> Result<Arc<DirNode>> {
        self.inodes.get(ino)?.into_dir(&ino.to_string())
    }

    fn file(&self, ino: u64) -> Result<Arc<FileNode>> {
        self.inodes.get(ino)?.into_file(&ino.to_string())
    }

    /// List the root folder
    fn load_root(&self, ctx: &OpContext) -> Result<()> {
        self.block_on(self.inodes.root().materialize(ctx))
    }

    /// Resolve `name` under `parent`, recording the kernel reference
    fn lookup_child(&self, parent: u64, name: &str, ctx: &OpContext) -> Result<(u64, NodeAttr)> {
        let dir = self.dir(parent)?;
        let node = self.block_on(dir.lookup(name, ctx))?;
        let ino = self.inodes.remember(&node);
        Ok((ino, node.attr()))
    }

    /// Attributes of `ino`, refreshed first when their window has passed.
    ///
    /// A failed refresh falls back to the cached attributes unless the
    /// remote reports the node gone.
    fn node_attr(&self, ino: u64, ctx: &OpContext) -> Result<NodeAttr> {
        let node = self.inodes.get(ino)?;
        let refreshed = match &node {
            Node::Dir(dir) if !dir.is_fresh() => self.block_on(dir.materialize(ctx)),
            Node::File(file) if !file.is_fresh() => self.block_on(file.refresh(ctx)),
            _ => Ok(()),
        };

        match refreshed {
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!("getattr: keeping cached attributes of inode {}: {}", ino, e);
                Ok(node.attr())
            }
            Ok(()) => Ok(node.attr()),
        }
    }

    /// Entries of directory `ino` starting after `offset`.
    ///
    /// The listing is refreshed when enumeration starts; later pages are
    /// served from the same listing so offsets stay stable.
    fn list_dir(
        &self,
        ino: u64,
        offset: i64,
        ctx: &OpContext,
    ) -> Result<Vec<(u64, FuserFileType, String)>> {
        let dir = self.dir(ino)?;
        let children = if offset == 0 || dir.entries().is_none() {
            self.block_on(dir.list_all(ctx))?
        } else {
            dir.snapshot()
        };

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FuserFileType::Directory, ".".to_string()));
        entries.push((
            self.inodes.folder_ino(dir.parent_folder_id()),
            FuserFileType::Directory,
            "..".to_string(),
        ));
        for child in children {
            let child_ino = match child.kind {
                NodeKind::Directory => self.inodes.folder_ino(child.ino),
                NodeKind::File => child.ino,
            };
            entries.push((child_ino, child.kind.to_fuser(), child.name));
        }
        Ok(entries)
    }

    /// Truncate a file to `size`
    fn set_size(&self, ino: u64, size: u64, ctx: &OpContext) -> Result<NodeAttr> {
        let file = self.file(ino)?;
        self.block_on(file.truncate(size, ctx))?;
        Ok(file.attr())
    }

    fn open_file(&self, ino: u64, open_flags: i32, ctx: &OpContext) -> Result<()> {
        let file = self.file(ino)?;
        if flags::wants_write(open_flags) {
            self.shared.ensure_writable()?;
        }
        self.block_on(file.open(open_flags, ctx))
    }

    fn read_file(
        &self,
        ino: u64,
        offset: u64,
        size: u32,
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<Bytes> {
        let file = self.file(ino)?;
        self.block_on(file.read(size, offset, open_flags, ctx))
    }

    fn write_file(
        &self,
        ino: u64,
        offset: u64,
        data: &[u8],
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<u64> {
        let file = self.file(ino)?;
        self.block_on(file.write(data, offset, open_flags, ctx))
    }

    fn flush_file(&self, ino: u64, ctx: &OpContext) -> Result<()> {
        let file = self.file(ino)?;
        self.block_on(file.flush(ctx))
    }

    fn release_file(&self, ino: u64, ctx: &OpContext) -> Result<()> {
        let file = self.file(ino)?;
        self.block_on(file.release(ctx))
    }

    /// Create an empty file under `parent`
    fn create_file(
        &self,
        parent: u64,
        name: &str,
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<(u64, NodeAttr)> {
        let dir = self.dir(parent)?;
        let file = self.block_on(dir.create(name, open_flags, ctx))?;
        let attr = file.attr();
        let ino = self.inodes.remember(&Node::File(file));
        Ok((ino, attr))
    }

    fn remove_entry(&self, parent: u64, name: &str, is_dir: bool, ctx: &OpContext) -> Result<()> {
        let dir = self.dir(parent)?;
        self.block_on(dir.remove(name, is_dir, ctx))
    }
}

/// fuser mount options for `mount`
pub fn mount_options(mount: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(mount.fs_name.clone()),
        MountOption::Subtype(mount.subtype.clone()),
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
    ];

    if mount.read_write {
        options.push(MountOption::RW);
    } else {
        options.push(MountOption::RO);
    }

    if mount.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }

    options
}

fn offset_of(offset: i64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))
}

impl Filesystem for DriveFs {
    fn init(
        &mut self,
        req: &Request<'_>,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        if let Err(max) = config.set_max_readahead(self.max_readahead) {
            debug!("init: kernel limits readahead to {}", max);
            let _ = config.set_max_readahead(max);
        }

        let ctx = self.context(req.unique());
        match self.load_root(&ctx) {
            Ok(()) => {
                info!("Mounted remote folder {}", self.inodes.root().folder_id());
                Ok(())
            }
            Err(e) => {
                error!("init: cannot list root folder: {}", e);
                Err(e.to_errno())
            }
        }
    }

    fn destroy(&mut self) {
        info!("Unmounting");
        self.shutdown();
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        debug!("lookup: parent={}, name={}", parent, name);

        let ctx = self.context(req.unique());
        match self.lookup_child(parent, name, &ctx) {
            Ok((ino, attr)) => reply.entry(&attr.ttl, &attr.to_fuser(ino), 0),
            Err(e) if e.is_not_found() => reply.error(libc::ENOENT),
            Err(e) => {
                error!("lookup error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        let ctx = self.context(req.unique());
        match self.node_attr(ino, &ctx) {
            Ok(attr) => reply.attr(&attr.ttl, &attr.to_fuser(ino)),
            Err(e) => {
                debug!("getattr error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, size={:?}", ino, size);

        let ctx = self.context(req.unique());
        // Only the length can be changed; ownership, mode and times are fixed
        let result = match size {
            Some(size) => self.set_size(ino, size, &ctx),
            None => self.node_attr(ino, &ctx),
        };

        match result {
            Ok(attr) => reply.attr(&attr.ttl, &attr.to_fuser(ino)),
            Err(e) => {
                error!("setattr error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let ctx = self.context(req.unique());
        let entries = match self.list_dir(ino, offset, &ctx) {
            Ok(entries) => entries,
            Err(e) => {
                error!("readdir error: {}", e);
                reply.error(e.to_errno());
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#x}", ino, flags);

        let ctx = self.context(req.unique());
        match self.open_file(ino, flags, &ctx) {
            // One descriptor per node: the inode doubles as the handle
            Ok(()) => reply.opened(ino, 0),
            Err(e) => {
                error!("open error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        let ctx = self.context(req.unique());
        let result = offset_of(offset)
            .and_then(|offset| self.read_file(ino, offset, size, flags, &ctx));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, offset={}, size={}", ino, offset, data.len());

        let ctx = self.context(req.unique());
        let result = offset_of(offset)
            .and_then(|offset| self.write_file(ino, offset, data, flags, &ctx));
        match result {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => {
                error!("write error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush: ino={}, fh={}", ino, fh);

        let ctx = self.context(req.unique());
        match self.flush_file(ino, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={}, fh={}", ino, fh);

        let ctx = self.context(req.unique());
        match self.release_file(ino, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("release error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        debug!("create: parent={}, name={}, mode={:o}", parent, name, mode);

        let ctx = self.context(req.unique());
        match self.create_file(parent, name, flags, &ctx) {
            Ok((ino, attr)) => reply.created(&attr.ttl, &attr.to_fuser(ino), 0, ino, 0),
            Err(e) => {
                error!("create error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        debug!("unlink: parent={}, name={}", parent, name);

        let ctx = self.context(req.unique());
        match self.remove_entry(parent, name, false, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("unlink error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        debug!("rmdir: parent={}, name={}", parent, name);

        let ctx = self.context(req.unique());
        match self.remove_entry(parent, name, true, &ctx) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("rmdir error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        // Quota is not queried; report a large, mostly free volume
        reply.statfs(
            1 << 32,          // blocks
            1 << 31,          // bfree
            1 << 31,          // bavail
            1 << 32,          // files
            1 << 31,          // ffree
            BLOCK_SIZE,       // bsize
            NAME_MAX,         // namelen
            BLOCK_SIZE,       // frsize
        );
    }
}
