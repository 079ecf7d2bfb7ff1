//! Immediate retry for provider calls.
//!
//! Retries here are back-to-back; there is no sleep between attempts. Any
//! waiting between failed *runs* belongs to the [gate](crate::gate). An
//! exhausted retry surfaces the last error, which the orchestrator then
//! records as a single gate failure.

use std::future::Future;

use tracing::warn;

use crate::error::SyncResult;

/// Retry wrapper around one fallible async operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseSync {
    /// Extra attempts after the first. `0` disables retrying.
    pub retries: u32,
}

impl Default for BaseSync {
    fn default() -> Self {
        BaseSync { retries: 1 }
    }
}

impl BaseSync {
    pub fn new(retries: u32) -> Self {
        BaseSync { retries }
    }

    /// Runs `op`, retrying immediately while it fails with a retryable
    /// error and attempts remain.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        operation = what,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "Retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SyncError {
        SyncError::TransientProvider {
            provider: "square".into(),
            message: "502".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = BaseSync::new(2)
            .run("fetch", || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(transient()),
                    _ => Ok(7),
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: SyncResult<()> = BaseSync::new(1)
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let _ = BaseSync::new(0)
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: SyncResult<()> = BaseSync::new(5)
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::AuthenticationFailed {
                    provider: "square".into(),
                })
            })
            .await;
        assert!(result.unwrap_err().is_auth_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
