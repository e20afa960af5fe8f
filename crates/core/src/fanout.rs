//! Bounded fan-out: run a batch of futures with a concurrency limit, wait for
//! all of them, and report failures as one aggregate error.

use std::fmt;
use std::future::Future;

use futures::stream::{self, StreamExt};

/// Failures of a task group, keyed by the task's position in the input.
#[derive(Debug)]
pub struct AggregateError<E> {
    pub total: usize,
    pub failures: Vec<(usize, E)>,
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} tasks failed", self.failures.len(), self.total)?;
        if let Some((idx, first)) = self.failures.first() {
            write!(f, "; first (task {}): {}", idx, first)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AggregateError<E> {}

/// Run every task to completion, at most `limit` at a time. Results come back
/// in input order; any failure turns the whole group into an `AggregateError`.
pub async fn join_bounded<I, Fut, T, E>(limit: usize, tasks: I) -> Result<Vec<T>, AggregateError<E>>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<T, E>>,
{
    let mut results: Vec<(usize, Result<T, E>)> = stream::iter(tasks.into_iter().enumerate().map(|(i, fut)| async move { (i, fut.await) }))
        .buffer_unordered(limit.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let total = results.len();
    let mut ok = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (i, r) in results {
        match r {
            Ok(v) => ok.push(v),
            Err(e) => failures.push((i, e)),
        }
    }
    if failures.is_empty() { Ok(ok) } else { Err(AggregateError { total, failures }) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order() {
        let tasks = (0..10u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(10 - i)).await;
            Ok::<u64, String>(i)
        });
        let out = join_bounded(4, tasks).await.unwrap();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..20).map(|_| {
            let live = live.clone();
            let peak = peak.clone();
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        });
        join_bounded(3, tasks).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failures_are_aggregated_after_all_tasks_ran() {
        let ran = Arc::new(AtomicUsize::new(0));
        let tasks = (0..6).map(|i| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                if i % 3 == 0 { Err(format!("task {} failed", i)) } else { Ok(i) }
            }
        });
        let err = join_bounded(2, tasks).await.unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 6);
        assert_eq!(err.total, 6);
        assert_eq!(err.failures.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 3]);
        assert!(err.to_string().starts_with("2 of 6 tasks failed"));
    }
}
