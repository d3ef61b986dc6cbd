//! pcloud-drive - pCloud account mounted as a FUSE filesystem
//!
//! This library maps the folders and files of a remote cloud account onto
//! kernel filesystem operations. Remote calls go through the
//! [`remote::RemoteStorage`] trait.

pub mod config;
pub mod error;
pub mod fs;
pub mod remote;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::DriveFs;
    pub use crate::remote::{MemoryRemote, RemoteStorage};
}
