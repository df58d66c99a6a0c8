//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound a future by a deadline and a cancellation token together
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Cancellation wins over an elapsed deadline when both are ready
//! - The wrapped future is dropped on either, releasing what it holds

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a bounded future did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Elapsed,
    Cancelled,
}

pub async fn with_deadline<F>(duration: Duration, cancel: &CancellationToken, fut: F) -> Result<F::Output, Deadline>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Deadline::Cancelled),
        res = tokio::time::timeout(duration, fut) => res.map_err(|_| Deadline::Elapsed),
    }
}
