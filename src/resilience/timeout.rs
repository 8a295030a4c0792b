use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Extension trait to race a future against a deadline.
///
/// When the deadline wins, the inner future is dropped. For a reqwest call
/// that aborts the request instead of leaving it running in the background.
pub trait TimeoutExt<T> {
    /// Add timeout to a future with custom duration
    async fn with_timeout_duration(self, duration: Duration) -> Result<T>;

    /// Add timeout to a future, also giving up when `cancel` fires
    async fn with_timeout_or_cancel(
        self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<T>;
}

impl<F, T> TimeoutExt<T> for F
where
    F: Future<Output = T>,
{
    async fn with_timeout_duration(self, duration: Duration) -> Result<T> {
        match timeout(duration, self).await {
            Ok(result) => Ok(result),
            Err(_) => Err(Error::Timeout { timeout: duration }),
        }
    }

    async fn with_timeout_or_cancel(
        self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.with_timeout_duration(duration) => result,
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
