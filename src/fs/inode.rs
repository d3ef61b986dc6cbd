//! Kernel inode table
//!
//! Inode numbers are remote ids. The mount root is reported to the kernel
//! as inode 1 whatever its remote folder id is.

use crate::error::{Error, Result};
use crate::fs::dir::DirNode;
use crate::fs::node::Node;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inode number the kernel uses for the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

struct Slot {
    node: Node,
    lookups: u64,
}

/// Nodes the kernel currently holds references to
pub struct InodeTable {
    root: Arc<DirNode>,
    nodes: DashMap<u64, Slot>,
}

impl InodeTable {
    pub fn new(root: Arc<DirNode>) -> Self {
        InodeTable {
            root,
            nodes: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Arc<DirNode> {
        &self.root
    }

    fn is_root(&self, node: &Node) -> bool {
        matches!(node, Node::Dir(dir) if Arc::ptr_eq(dir, &self.root))
    }

    /// Inode number reported for `node`
    pub fn kernel_ino(&self, node: &Node) -> u64 {
        if self.is_root(node) {
            ROOT_INO
        } else {
            node.ino()
        }
    }

    /// Inode number reported for a folder id, mapping the root folder to 1
    pub fn folder_ino(&self, folder_id: u64) -> u64 {
        if folder_id == self.root.folder_id() {
            ROOT_INO
        } else {
            folder_id
        }
    }

    /// Resolve a kernel inode number
    pub fn get(&self, ino: u64) -> Result<Node> {
        if ino == ROOT_INO {
            return Ok(Node::Dir(self.root.clone()));
        }
        self.nodes
            .get(&ino)
            .map(|slot| slot.node.clone())
            .ok_or(Error::InodeNotFound(ino))
    }

    /// Record one kernel lookup of `node` and return its inode number
    pub fn remember(&self, node: &Node) -> u64 {
        let ino = self.kernel_ino(node);
        if ino == ROOT_INO {
            if !self.is_root(node) {
                warn!("remote id {} collides with the root inode", node.ino());
            }
            return ROOT_INO;
        }

        let mut slot = self.nodes.entry(ino).or_insert_with(|| Slot {
            node: node.clone(),
            lookups: 0,
        });
        if !slot.node.same(node) {
            if slot.node.kind() != node.kind() {
                warn!(
                    "inode {} changed from {:?} to {:?}",
                    ino,
                    slot.node.kind(),
                    node.kind()
                );
            }
            slot.node = node.clone();
        }
        slot.lookups += 1;
        ino
    }

    /// Drop `count` kernel references, evicting the node at zero
    pub fn forget(&self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let evicted = self
            .nodes
            .remove_if_mut(&ino, |_, slot| {
                slot.lookups = slot.lookups.saturating_sub(count);
                slot.lookups == 0
            })
            .is_some();
        if evicted {
            debug!("forget: inode {} evicted", ino);
        }
    }

    /// Number of tracked inodes, not counting the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::FileNode;
    use crate::fs::testing::shared;
    use crate::remote::{MemoryRemote, ROOT_FOLDER_ID};

    fn table() -> (InodeTable, Arc<crate::fs::node::FsShared>) {
        let shared = shared(Arc::new(MemoryRemote::new()), false);
        let root = Arc::new(DirNode::root(shared.clone(), ROOT_FOLDER_ID));
        (InodeTable::new(root), shared)
    }

    #[test]
    fn test_root_alias() {
        let (table, _) = table();
        let root = table.get(ROOT_INO).unwrap();
        assert_eq!(table.kernel_ino(&root), ROOT_INO);
        assert_eq!(table.remember(&root), ROOT_INO);
        assert_eq!(table.folder_ino(ROOT_FOLDER_ID), ROOT_INO);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remember_and_forget() {
        let (table, shared) = table();
        let file = Node::File(Arc::new(FileNode::created(shared, 1234, ROOT_FOLDER_ID)));

        assert_eq!(table.remember(&file), 1234);
        assert_eq!(table.remember(&file), 1234);
        assert!(table.get(1234).unwrap().same(&file));

        table.forget(1234, 1);
        assert!(table.get(1234).is_ok());
        table.forget(1234, 1);
        assert!(matches!(table.get(1234), Err(Error::InodeNotFound(1234))));
    }

    #[test]
    fn test_remember_replaces_stale_node() {
        let (table, shared) = table();
        let old = Node::File(Arc::new(FileNode::created(shared.clone(), 77, ROOT_FOLDER_ID)));
        let new = Node::File(Arc::new(FileNode::created(shared, 77, ROOT_FOLDER_ID)));

        table.remember(&old);
        table.remember(&new);

        assert!(table.get(77).unwrap().same(&new));
        table.forget(77, 1);
        assert!(table.get(77).is_ok());
    }
}
