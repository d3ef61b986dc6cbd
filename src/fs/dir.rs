//! Directory nodes and their cached listings

use crate::error::{Error, Result};
use crate::fs::attr::{NodeAttr, NodeKind};
use crate::fs::context::OpContext;
use crate::fs::file::FileNode;
use crate::fs::flags;
use crate::fs::node::{FsShared, Node};
use crate::remote::{Metadata, OpenFlags, OpenTarget};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cached children of a directory, keyed by name
pub type Entries = Arc<HashMap<String, Node>>;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: NodeKind,
}

struct DirState {
    folder_id: u64,
    parent_folder_id: u64,
    /// `None` until the first successful listing
    entries: Option<Entries>,
    attr: NodeAttr,
}

/// A remote folder
pub struct DirNode {
    shared: Arc<FsShared>,
    state: RwLock<DirState>,
}

impl std::fmt::Debug for DirNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DirNode({})", self.folder_id())
    }
}

impl DirNode {
    /// Node for the mount root. Its attributes start stale so the first
    /// access lists it.
    pub fn root(shared: Arc<FsShared>, folder_id: u64) -> Self {
        let attr = shared.policy.unlisted_dir_attr(folder_id);
        DirNode {
            shared,
            state: RwLock::new(DirState {
                folder_id,
                parent_folder_id: folder_id,
                entries: None,
                attr,
            }),
        }
    }

    /// Node for a folder reported by its parent's listing
    pub fn from_metadata(shared: Arc<FsShared>, meta: &Metadata) -> Self {
        let attr = shared.policy.dir_attr(meta);
        DirNode {
            shared,
            state: RwLock::new(DirState {
                folder_id: meta.id,
                parent_folder_id: meta.parent_folder_id,
                entries: None,
                attr,
            }),
        }
    }

    pub fn folder_id(&self) -> u64 {
        self.state.read().folder_id
    }

    pub fn parent_folder_id(&self) -> u64 {
        self.state.read().parent_folder_id
    }

    pub fn attr(&self) -> NodeAttr {
        self.state.read().attr.clone()
    }

    pub fn is_fresh(&self) -> bool {
        self.state.read().attr.is_fresh()
    }

    /// Current entry map, if the folder was ever listed
    pub fn entries(&self) -> Option<Entries> {
        self.state.read().entries.clone()
    }

    fn cached(&self, name: &str) -> Option<Node> {
        self.state
            .read()
            .entries
            .as_ref()
            .and_then(|entries| entries.get(name).cloned())
    }

    /// Refresh attributes from the parent's listing, keeping cached entries
    fn update_from(&self, meta: &Metadata) {
        let attr = self.shared.policy.dir_attr(meta);
        let mut state = self.state.write();
        state.parent_folder_id = meta.parent_folder_id;
        state.attr = attr;
    }

    /// List the remote folder and replace the cached entries.
    ///
    /// Children whose id and kind are unchanged keep their node so open
    /// handles and nested listings stay attached. On failure nothing changes.
    pub async fn materialize(&self, ctx: &OpContext) -> Result<()> {
        let folder_id = self.folder_id();
        let listing = ctx.run(self.shared.remote.list_folder(folder_id)).await?;

        let previous = self.entries();
        let mut entries = HashMap::with_capacity(listing.contents.len());
        for meta in &listing.contents {
            let kept = previous.as_ref().and_then(|p| p.get(&meta.name));
            let node = match kept {
                Some(Node::Dir(dir)) if meta.is_folder() && dir.folder_id() == meta.id => {
                    dir.update_from(meta);
                    Node::Dir(dir.clone())
                }
                Some(Node::File(file)) if !meta.is_folder() && file.file_id() == meta.id => {
                    file.apply_metadata(meta);
                    Node::File(file.clone())
                }
                _ => self.child(meta),
            };
            entries.insert(meta.name.clone(), node);
        }

        let attr = self.shared.policy.dir_attr(&listing.metadata);
        let count = entries.len();
        {
            let mut state = self.state.write();
            state.folder_id = listing.metadata.id;
            state.parent_folder_id = listing.metadata.parent_folder_id;
            state.entries = Some(Arc::new(entries));
            state.attr = attr;
        }

        debug!(
            "materialize: folder {} has {} entries (request {})",
            listing.metadata.id,
            count,
            ctx.request_id()
        );
        Ok(())
    }

    fn child(&self, meta: &Metadata) -> Node {
        if meta.is_folder() {
            Node::Dir(Arc::new(DirNode::from_metadata(self.shared.clone(), meta)))
        } else {
            Node::File(Arc::new(FileNode::from_metadata(self.shared.clone(), meta)))
        }
    }

    /// Find a child by name, listing the folder once if it is not cached
    pub async fn lookup(&self, name: &str, ctx: &OpContext) -> Result<Node> {
        if let Some(node) = self.cached(name) {
            return Ok(node);
        }

        self.materialize(ctx).await?;
        self.cached(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Fresh listing of every child, sorted by name
    pub async fn list_all(&self, ctx: &OpContext) -> Result<Vec<DirEntry>> {
        self.materialize(ctx).await?;
        Ok(self.snapshot())
    }

    /// Cached listing sorted by name, without contacting the remote
    pub fn snapshot(&self) -> Vec<DirEntry> {
        let Some(entries) = self.entries() else {
            return Vec::new();
        };

        let mut listing: Vec<DirEntry> = entries
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                ino: node.ino(),
                kind: node.kind(),
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        listing
    }

    /// Create an empty file in this folder.
    ///
    /// The descriptor returned by the remote create is closed again right
    /// away; the caller opens the file separately.
    ///
    /// Without `O_EXCL`, a name that already exists remotely is reopened
    /// rather than replaced. Its data is kept, but the returned node reports
    /// size 0 until the next listing or refresh of the file.
    pub async fn create(
        &self,
        name: &str,
        open_flags: i32,
        ctx: &OpContext,
    ) -> Result<Arc<FileNode>> {
        self.shared.ensure_writable()?;
        validate_name(name)?;

        let folder_id = self.folder_id();
        let remote_flags = flags::translate(open_flags) | OpenFlags::CREAT | OpenFlags::WRITE;
        let opened = self
            .shared
            .open_remote(
                remote_flags,
                OpenTarget::Path {
                    folder_id,
                    name: name.to_string(),
                },
                ctx,
            )
            .await?;

        let cleanup = ctx.cleanup_scope();
        if let Err(e) = cleanup.run(self.shared.remote.close(opened.fd)).await {
            warn!(
                "create: failed to close descriptor {} of new file {:?}: {}",
                opened.fd.0, name, e
            );
        }

        let file = Arc::new(FileNode::created(
            self.shared.clone(),
            opened.file_id,
            folder_id,
        ));
        self.insert(name, Node::File(file.clone()));

        debug!(
            "create: {:?} in folder {} is file {}",
            name, folder_id, opened.file_id
        );
        Ok(file)
    }

    /// Delete a child remotely and drop it from the cache.
    ///
    /// The entry is evicted even when the remote delete fails. A child that
    /// is already gone remotely counts as removed.
    pub async fn remove(&self, name: &str, is_dir: bool, ctx: &OpContext) -> Result<()> {
        self.shared.ensure_writable()?;

        let node = self.lookup(name, ctx).await?;
        let result = match (&node, is_dir) {
            (Node::Dir(dir), true) => ctx.run(self.shared.remote.delete_folder(dir.folder_id())).await,
            (Node::File(file), false) => ctx.run(self.shared.remote.delete_file(file.file_id())).await,
            (Node::Dir(_), false) => return Err(Error::IsADirectory(name.to_string())),
            (Node::File(_), true) => return Err(Error::NotADirectory(name.to_string())),
        };

        self.evict(name, &node);

        match result {
            Err(e) if e.is_not_found() => {
                debug!("remove: {:?} was already gone", name);
                Ok(())
            }
            other => other,
        }
    }

    /// Copy-on-write insert; readers holding the old map are unaffected
    fn insert(&self, name: &str, node: Node) {
        let mut state = self.state.write();
        if let Some(entries) = state.entries.as_mut() {
            Arc::make_mut(entries).insert(name.to_string(), node);
        }
    }

    /// Drop `name` if it still refers to `node`
    fn evict(&self, name: &str, node: &Node) {
        let mut state = self.state.write();
        if let Some(entries) = state.entries.as_mut() {
            if entries.get(name).is_some_and(|current| current.same(node)) {
                Arc::make_mut(entries).remove(name);
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::{ctx, shared, SlowOpenRemote};
    use crate::remote::{MemoryRemote, RemoteError, RemoteOp, ROOT_FOLDER_ID};
    use std::time::Duration;

    fn root(remote: &Arc<MemoryRemote>, writable: bool) -> DirNode {
        DirNode::root(shared(remote.clone(), writable), ROOT_FOLDER_ID)
    }

    #[tokio::test]
    async fn test_list_all_reports_kinds_and_ids() {
        let remote = Arc::new(MemoryRemote::new());
        let file_id = remote.add_file(ROOT_FOLDER_ID, "a.txt", &[0u8; 10]);
        let sub_id = remote.add_folder(ROOT_FOLDER_ID, "sub");
        let dir = root(&remote, false);

        let listing = dir.list_all(&ctx()).await.unwrap();
        assert_eq!(
            listing,
            vec![
                DirEntry {
                    name: "a.txt".to_string(),
                    ino: file_id,
                    kind: NodeKind::File,
                },
                DirEntry {
                    name: "sub".to_string(),
                    ino: sub_id,
                    kind: NodeKind::Directory,
                },
            ]
        );

        let node = dir.lookup("a.txt", &ctx()).await.unwrap();
        assert_eq!(node.attr().size, 10);
    }

    #[tokio::test]
    async fn test_list_all_always_relists() {
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        let dir = root(&remote, false);

        assert_eq!(dir.list_all(&ctx()).await.unwrap().len(), 1);
        remote.add_file(ROOT_FOLDER_ID, "b.txt", b"b");
        let names: Vec<String> = dir
            .list_all(&ctx())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();

        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(remote.calls().list_folder, 2);
    }

    #[tokio::test]
    async fn test_lookup_refreshes_once_for_new_entry() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = root(&remote, false);
        dir.materialize(&ctx()).await.unwrap();

        let id = remote.add_file(ROOT_FOLDER_ID, "late.txt", b"x");
        let node = dir.lookup("late.txt", &ctx()).await.unwrap();

        assert_eq!(node.ino(), id);
        assert_eq!(remote.calls().list_folder, 2);

        // cached now
        dir.lookup("late.txt", &ctx()).await.unwrap();
        assert_eq!(remote.calls().list_folder, 2);
    }

    #[tokio::test]
    async fn test_lookup_missing_does_not_loop() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = root(&remote, false);

        let err = dir.lookup("missing", &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref name) if name == "missing"));
        assert_eq!(remote.calls().list_folder, 1);
    }

    #[tokio::test]
    async fn test_failed_materialize_keeps_entries() {
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        let dir = root(&remote, false);
        dir.materialize(&ctx()).await.unwrap();
        let before = dir.entries().unwrap();

        remote.fail_next(RemoteOp::ListFolder, RemoteError::Transport("reset".into()));
        let err = dir.materialize(&ctx()).await.unwrap_err();

        assert!(matches!(err, Error::Remote(RemoteError::Transport(_))));
        assert!(Arc::ptr_eq(&before, &dir.entries().unwrap()));
        assert!(dir.lookup("a.txt", &ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_materialize_keeps_unchanged_children() {
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        remote.add_folder(ROOT_FOLDER_ID, "sub");
        let dir = root(&remote, false);

        let file = dir.lookup("a.txt", &ctx()).await.unwrap();
        let sub = dir.lookup("sub", &ctx()).await.unwrap();
        dir.list_all(&ctx()).await.unwrap();

        assert!(file.same(&dir.lookup("a.txt", &ctx()).await.unwrap()));
        assert!(sub.same(&dir.lookup("sub", &ctx()).await.unwrap()));
    }

    #[tokio::test]
    async fn test_materialize_replaces_swapped_children() {
        let remote = Arc::new(MemoryRemote::new());
        let old_id = remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        let dir = root(&remote, false);
        let old = dir.lookup("a.txt", &ctx()).await.unwrap();

        remote.remove_file(old_id);
        let new_id = remote.add_file(ROOT_FOLDER_ID, "a.txt", b"bb");
        dir.materialize(&ctx()).await.unwrap();

        let new = dir.lookup("a.txt", &ctx()).await.unwrap();
        assert!(!old.same(&new));
        assert_eq!(new.ino(), new_id);
        assert_eq!(new.attr().size, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookup_and_list() {
        let remote = Arc::new(MemoryRemote::new());
        for i in 0..20 {
            remote.add_file(ROOT_FOLDER_ID, &format!("f{}", i), b"x");
        }
        remote.set_latency(Some(Duration::from_millis(2)));
        let dir = Arc::new(root(&remote, false));

        let tasks = (0..20).map(|i| {
            let dir = dir.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    dir.list_all(&ctx()).await.map(|listing| listing.len())
                } else {
                    dir.lookup(&format!("f{}", i), &ctx()).await.map(|_| 20)
                }
            })
        });

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), 20);
        }
    }

    #[tokio::test]
    async fn test_create_closes_descriptor_and_inserts() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = root(&remote, true);
        dir.materialize(&ctx()).await.unwrap();

        let file = dir
            .create("new.txt", libc::O_CREAT | libc::O_WRONLY, &ctx())
            .await
            .unwrap();

        assert_eq!(file.attr().size, 0);
        assert_eq!(remote.open_descriptors(), 0);
        assert_eq!(remote.calls().close, 1);
        assert_eq!(file.parent_folder_id(), ROOT_FOLDER_ID);

        // visible without another listing
        let node = dir.lookup("new.txt", &ctx()).await.unwrap();
        assert_eq!(node.ino(), file.file_id());
        assert_eq!(remote.calls().list_folder, 1);
    }

    #[tokio::test]
    async fn test_create_survives_close_failure() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = root(&remote, true);
        remote.fail_next(RemoteOp::Close, RemoteError::Transport("reset".into()));

        let file = dir.create("new.txt", libc::O_CREAT, &ctx()).await.unwrap();
        assert!(remote.file_contents(file.file_id()).is_some());
    }

    #[tokio::test]
    async fn test_create_exclusive_conflict() {
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(ROOT_FOLDER_ID, "taken", b"");
        let dir = root(&remote, true);

        let err = dir
            .create("taken", libc::O_CREAT | libc::O_EXCL, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[tokio::test]
    async fn test_create_timed_out_leaves_no_descriptor() {
        let remote = Arc::new(MemoryRemote::new());
        let slow = Arc::new(SlowOpenRemote::new(remote.clone(), Duration::from_millis(200)));
        let dir = DirNode::root(shared(slow, true), ROOT_FOLDER_ID);
        let ctx = OpContext::new(11).with_timeout(Some(Duration::from_millis(50)));

        let err = dir
            .create("late.txt", libc::O_CREAT | libc::O_WRONLY, &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TimedOut(11)));
        assert_eq!(remote.open_descriptors(), 0);
        assert_eq!(remote.calls().close, 1);
        assert!(dir.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_name_reports_zero_size() {
        let remote = Arc::new(MemoryRemote::new());
        let id = remote.add_file(ROOT_FOLDER_ID, "kept.txt", b"contents");
        let dir = root(&remote, true);
        dir.materialize(&ctx()).await.unwrap();

        let file = dir.create("kept.txt", libc::O_CREAT, &ctx()).await.unwrap();

        assert_eq!(file.file_id(), id);
        assert_eq!(file.attr().size, 0);
        assert_eq!(remote.file_contents(id).unwrap(), b"contents");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names_and_read_only() {
        let remote = Arc::new(MemoryRemote::new());

        let dir = root(&remote, true);
        let err = dir.create("a/b", libc::O_CREAT, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));

        let dir = root(&remote, false);
        let err = dir.create("a", libc::O_CREAT, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
        assert_eq!(remote.calls().open, 0);
    }

    #[tokio::test]
    async fn test_remove_file_and_folder() {
        let remote = Arc::new(MemoryRemote::new());
        let file_id = remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        let sub_id = remote.add_folder(ROOT_FOLDER_ID, "sub");
        let dir = root(&remote, true);

        dir.remove("a.txt", false, &ctx()).await.unwrap();
        dir.remove("sub", true, &ctx()).await.unwrap();

        assert!(remote.file_contents(file_id).is_none());
        assert!(remote.metadata(sub_id).is_none());
        assert!(dir.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_remove_kind_mismatch() {
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        remote.add_folder(ROOT_FOLDER_ID, "sub");
        let dir = root(&remote, true);

        let err = dir.remove("a.txt", true, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));
        let err = dir.remove("sub", false, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)));
        assert_eq!(dir.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_already_gone_is_ok() {
        let remote = Arc::new(MemoryRemote::new());
        let id = remote.add_file(ROOT_FOLDER_ID, "a.txt", b"a");
        let dir = root(&remote, true);
        dir.materialize(&ctx()).await.unwrap();

        remote.remove_file(id);
        dir.remove("a.txt", false, &ctx()).await.unwrap();
        assert!(dir.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_remove_failure_still_evicts() {
        let remote = Arc::new(MemoryRemote::new());
        let sub = remote.add_folder(ROOT_FOLDER_ID, "sub");
        remote.add_file(sub, "inner", b"x");
        let dir = root(&remote, true);

        let err = dir.remove("sub", true, &ctx()).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
        assert!(dir.snapshot().is_empty());

        // the next lookup relists and finds it again
        assert!(dir.lookup("sub", &ctx()).await.is_ok());
    }
}
