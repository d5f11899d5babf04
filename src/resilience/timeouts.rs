//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap socket operations with an optional deadline
//! - Keep timeout errors distinct from I/O errors
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - `None` means wait forever, matching a zero in the config
//! - Callers decide the status to report (504 for origin-side timeouts)

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// An operation did not finish within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} timed out after {elapsed:?}")]
pub struct TimeoutError {
    pub operation: &'static str,
    pub elapsed: Duration,
}

/// Run `fut` under `limit`, or unbounded when `limit` is `None`.
pub async fn with_timeout<F, T>(
    limit: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TimeoutError {
                operation,
                elapsed: limit,
            }),
        None => Ok(fut.await),
    }
}
