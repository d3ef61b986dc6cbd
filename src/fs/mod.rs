//! FUSE filesystem implementation
//!
//! Exposes a remote cloud drive through the FUSE interface. Directories
//! cache their listings for a short window; files hold at most one remote
//! descriptor, opened on demand.

pub mod attr;
pub mod context;
pub mod dir;
pub mod file;
mod filesystem;
pub mod flags;
pub mod inode;
pub mod invalidate;
pub mod node;

#[cfg(test)]
mod testing;

pub use filesystem::{mount_options, DriveFs};
