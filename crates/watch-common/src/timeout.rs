//! Deadline helper for bounded request lifetimes.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::WatchError;

/// Run a future, abandoning it once `timeout` elapses.
///
/// Abandonment only drops the caller's future. Work that was already handed to
/// another task (a worker cache write, for instance) keeps running.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> Result<T, WatchError>
where
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(value) => Ok(value),
        Err(_) => {
            debug!(?timeout, "Operation abandoned after deadline");
            Err(WatchError::Timeout(timeout))
        }
    }
}
