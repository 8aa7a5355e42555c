//! Async timeout wrappers.
//!
//! Deadline expiry is surfaced as `ClientError::Timeout` so callers handle
//! one error shape for both protocol and local timeouts.

use crate::error::{ClientError, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut` under a deadline, mapping expiry to `ClientError::Timeout`.
pub async fn with_timeout<T, F>(fut: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

/// Like [`with_timeout`], but `None` means no deadline.
pub async fn with_optional_timeout<T, F>(fut: F, timeout: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(t) => with_timeout(fut, t).await,
        None => fut.await,
    }
}
