//! Bounded polling: re-check a predicate at a fixed interval until it holds or
//! the timeout passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("timed out after {0:?} waiting for condition")]
    Timeout(Duration),
    /// The predicate itself failed; polling stops.
    #[error("condition failed: {0}")]
    Condition(E),
}

/// Poll `condition` immediately and then every `interval` until it returns
/// `Ok(true)`. An `Err` from the condition aborts the wait.
pub async fn poll_until<F, Fut, E>(interval: Duration, timeout: Duration, mut condition: F) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if condition().await.map_err(WaitError::Condition)? {
            debug!(attempts, "condition met");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout(timeout));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
