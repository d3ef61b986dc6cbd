//! Kernel attribute invalidation
//!
//! Used when the filesystem no longer trusts a size it reported, e.g. after
//! a write whose resulting length could not be confirmed remotely.

use std::io;
use std::sync::OnceLock;
use tracing::debug;

/// Asks the kernel to drop its cached attributes for an inode
pub trait Invalidator: Send + Sync {
    fn invalidate_attr(&self, ino: u64) -> io::Result<()>;
}

/// Invalidator for setups without a kernel connection
#[derive(Debug, Default)]
pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate_attr(&self, _ino: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Invalidator backed by a fuser session notifier.
///
/// The notifier only exists once the session is mounted, after the
/// filesystem has been constructed, so it is attached late.
#[derive(Default)]
pub struct KernelInvalidator {
    notifier: OnceLock<fuser::Notifier>,
}

impl KernelInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the session notifier. Only the first call has an effect.
    pub fn attach(&self, notifier: fuser::Notifier) {
        if self.notifier.set(notifier).is_err() {
            debug!("kernel invalidator already attached");
        }
    }
}

impl Invalidator for KernelInvalidator {
    fn invalidate_attr(&self, ino: u64) -> io::Result<()> {
        match self.notifier.get() {
            Some(notifier) => notifier.inval_inode(ino, 0, 0),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no kernel session attached",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_kernel_invalidator_fails() {
        let invalidator = KernelInvalidator::new();
        let err = invalidator.invalidate_attr(5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_noop_invalidator() {
        assert!(NoopInvalidator.invalidate_attr(5).is_ok());
    }
}
