//! Per-operation context: request id, cancellation and deadline

use crate::error::{Error, Result};
use crate::remote::RemoteResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline for cleanup calls when none is configured
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Context carried by one filesystem operation and threaded into every
/// remote call it issues.
#[derive(Debug, Clone)]
pub struct OpContext {
    request_id: u64,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    cleanup_timeout: Duration,
}

impl OpContext {
    /// Context with its own cancellation token and no deadline
    pub fn new(request_id: u64) -> Self {
        OpContext {
            request_id,
            cancel: CancellationToken::new(),
            deadline: None,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    /// Use `token` for cancellation, typically a child of the filesystem's
    /// shutdown token
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fail remote calls that have not completed within `timeout` from now
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context for best-effort cleanup of resources this operation acquired.
    ///
    /// It is detached from the caller's cancellation so a descriptor opened
    /// mid-operation still gets closed, but it has its own short deadline.
    pub fn cleanup_scope(&self) -> OpContext {
        OpContext {
            request_id: self.request_id,
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + self.cleanup_timeout),
            cleanup_timeout: self.cleanup_timeout,
        }
    }

    /// Run one remote call under this context.
    ///
    /// A call that completes is always reported, even if cancellation fired
    /// at the same time, so the caller can release what it acquired.
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled(self.request_id));
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    result = call => result.map_err(Error::from),
                    _ = self.cancel.cancelled() => Err(Error::Canceled(self.request_id)),
                    _ = tokio::time::sleep_until(deadline) => Err(Error::TimedOut(self.request_id)),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    result = call => result.map_err(Error::from),
                    _ = self.cancel.cancelled() => Err(Error::Canceled(self.request_id)),
                }
            }
        }
    }
}
