//! POSIX attributes synthesized from remote metadata

use crate::config::MountConfig;
use crate::remote::Metadata;
use chrono::{DateTime, Utc};
use fuser::{FileAttr, FileType};
use std::time::{Duration, Instant, SystemTime};

/// Block size reported for every node
pub const BLOCK_SIZE: u32 = 4096;

/// Owner reported for every node: the mounting user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Resolve the user running this process
    pub fn current() -> Self {
        Owner {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

impl NodeKind {
    pub fn to_fuser(self) -> FileType {
        match self {
            NodeKind::Directory => FileType::Directory,
            NodeKind::File => FileType::RegularFile,
        }
    }
}

/// Attributes of a node plus the deadline after which they must be refreshed
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// How long the kernel may cache these attributes
    pub ttl: Duration,
    valid_until: Instant,
}

impl NodeAttr {
    /// Whether the attributes are still inside their validity window
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.valid_until
    }

    /// Force the next freshness check to fail
    pub fn expire(&mut self) {
        self.valid_until = Instant::now();
    }

    /// Record a locally known new size
    pub fn set_size(&mut self, size: u64) {
        let now = SystemTime::now();
        self.size = size;
        self.mtime = now;
        self.ctime = now;
        self.valid_until = Instant::now() + self.ttl;
    }

    /// Convert to a fuser attribute record reported under `ino`
    pub fn to_fuser(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Fixed permissions, owner and validity windows applied to every node
#[derive(Debug, Clone)]
pub struct AttrPolicy {
    pub owner: Owner,
    pub dir_perm: u16,
    pub file_perm: u16,
    pub dir_ttl: Duration,
    pub file_ttl: Duration,
}

impl AttrPolicy {
    pub fn new(owner: Owner, mount: &MountConfig) -> Self {
        AttrPolicy {
            owner,
            dir_perm: mount.dir_mode,
            file_perm: mount.file_mode,
            dir_ttl: mount.dir_ttl(),
            file_ttl: mount.file_ttl(),
        }
    }

    /// Attributes for a remote folder
    pub fn dir_attr(&self, meta: &Metadata) -> NodeAttr {
        self.build(
            meta.id,
            NodeKind::Directory,
            0,
            to_system_time(meta.created),
            to_system_time(meta.modified),
        )
    }

    /// Attributes for a remote file
    pub fn file_attr(&self, meta: &Metadata) -> NodeAttr {
        self.build(
            meta.id,
            NodeKind::File,
            meta.size,
            to_system_time(meta.created),
            to_system_time(meta.modified),
        )
    }

    /// Attributes for a file that was just created
    pub fn new_file_attr(&self, file_id: u64) -> NodeAttr {
        let now = SystemTime::now();
        self.build(file_id, NodeKind::File, 0, now, now)
    }

    /// Placeholder attributes for a folder that has not been listed yet.
    /// They start out expired.
    pub fn unlisted_dir_attr(&self, folder_id: u64) -> NodeAttr {
        let mut attr = self.build(
            folder_id,
            NodeKind::Directory,
            0,
            SystemTime::UNIX_EPOCH,
            SystemTime::UNIX_EPOCH,
        );
        attr.expire();
        attr
    }

    fn build(
        &self,
        ino: u64,
        kind: NodeKind,
        size: u64,
        created: SystemTime,
        modified: SystemTime,
    ) -> NodeAttr {
        let (perm, ttl) = match kind {
            NodeKind::Directory => (self.dir_perm, self.dir_ttl),
            NodeKind::File => (self.file_perm, self.file_ttl),
        };

        NodeAttr {
            ino,
            kind,
            size,
            atime: modified,
            mtime: modified,
            ctime: modified,
            crtime: created,
            perm,
            nlink: 1,
            uid: self.owner.uid,
            gid: self.owner.gid,
            ttl,
            valid_until: Instant::now() + ttl,
        }
    }
}

fn to_system_time(t: DateTime<Utc>) -> SystemTime {
    SystemTime::from(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::EntryKind;
    use chrono::TimeZone;

    fn policy() -> AttrPolicy {
        AttrPolicy::new(Owner { uid: 501, gid: 20 }, &MountConfig::default())
    }

    fn meta(kind: EntryKind, id: u64, size: u64) -> Metadata {
        Metadata {
            name: "x".to_string(),
            kind,
            id,
            parent_folder_id: 0,
            size,
            created: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            modified: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_dir_attr() {
        let attr = policy().dir_attr(&meta(EntryKind::Folder, 42, 0));
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, NodeKind::Directory);
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.ttl, Duration::from_secs(2));
        assert_eq!((attr.uid, attr.gid), (501, 20));
        assert!(attr.is_fresh());

        let fuser_attr = attr.to_fuser(1);
        assert_eq!(fuser_attr.ino, 1);
        assert_eq!(fuser_attr.kind, FileType::Directory);
    }

    #[test]
    fn test_file_attr_timestamps_follow_modified() {
        let m = meta(EntryKind::File, 7, 1000);
        let attr = policy().file_attr(&m);
        let modified = SystemTime::from(m.modified);

        assert_eq!(attr.size, 1000);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.ttl, Duration::from_secs(1));
        assert_eq!(attr.atime, modified);
        assert_eq!(attr.mtime, modified);
        assert_eq!(attr.ctime, modified);
        assert_eq!(attr.crtime, SystemTime::from(m.created));

        let fuser_attr = attr.to_fuser(7);
        assert_eq!(fuser_attr.blocks, 2);
        assert_eq!(fuser_attr.blksize, BLOCK_SIZE);
        assert_eq!(fuser_attr.kind, FileType::RegularFile);
    }

    #[test]
    fn test_expire_and_set_size() {
        let mut attr = policy().new_file_attr(9);
        assert_eq!(attr.size, 0);

        attr.expire();
        assert!(!attr.is_fresh());

        attr.set_size(123);
        assert_eq!(attr.size, 123);
        assert!(attr.is_fresh());
    }

    #[test]
    fn test_unlisted_dir_starts_stale() {
        let attr = policy().unlisted_dir_attr(3);
        assert!(!attr.is_fresh());
        assert_eq!(attr.kind, NodeKind::Directory);
    }
}
