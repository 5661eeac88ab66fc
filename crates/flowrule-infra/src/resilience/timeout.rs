//! Timeout handling

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Timeout error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Operation '{operation}' timed out after {duration:?}")]
pub struct TimeoutError {
    /// Duration that was exceeded
    pub duration: Duration,
    /// Operation name
    pub operation: String,
}

/// Run `operation` with an upper bound on its duration.
pub async fn with_timeout<F, Fut, T>(
    timeout: Duration,
    operation_name: &str,
    operation: F,
) -> Result<T, TimeoutError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match tokio::time::timeout(timeout, operation()).await {
        Ok(result) => Ok(result),
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(TimeoutError {
                duration: timeout,
                operation: operation_name.to_string(),
            })
        }
    }
}
