//! Controller tuning, read from `NSLIFE_*` environment variables.

use std::time::Duration;

use nslife_queue::Backoff;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum number of namespaces drained at the same time.
    pub workers: usize,
    /// Adapters run concurrently within one drain pass.
    pub adapter_concurrency: usize,
    /// Full relist interval for the phase tracker.
    pub resync: Duration,
    pub backoff: Backoff,
    pub stuck_after_retries: u32,
    pub stuck_after: Duration,
    pub list_page_size: usize,
    /// How often the status report is refreshed when nothing else changes.
    pub report_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            adapter_concurrency: 4,
            resync: Duration::from_secs(30),
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(30)),
            stuck_after_retries: 10,
            stuck_after: Duration::from_secs(300),
            list_page_size: 500,
            report_interval: Duration::from_secs(1),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let base_ms = env_or("NSLIFE_BACKOFF_BASE_MS", d.backoff.base.as_millis() as u64);
        let max_secs = env_or("NSLIFE_BACKOFF_MAX_SECS", d.backoff.max.as_secs());
        Self {
            workers: env_or("NSLIFE_WORKERS", d.workers).max(1),
            adapter_concurrency: env_or("NSLIFE_ADAPTER_CONCURRENCY", d.adapter_concurrency).max(1),
            resync: Duration::from_secs(env_or("NSLIFE_RESYNC_SECS", d.resync.as_secs()).max(1)),
            backoff: Backoff::new(Duration::from_millis(base_ms), Duration::from_secs(max_secs)),
            stuck_after_retries: env_or("NSLIFE_STUCK_AFTER_RETRIES", d.stuck_after_retries),
            stuck_after: Duration::from_secs(env_or("NSLIFE_STUCK_AFTER_SECS", d.stuck_after.as_secs())),
            list_page_size: env_or("NSLIFE_LIST_PAGE", d.list_page_size).max(1),
            report_interval: d.report_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("NSLIFE_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("NSLIFE_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("NSLIFE_TEST_NUMBER", "12");
        assert_eq!(env_or("NSLIFE_TEST_NUMBER", 7usize), 12);
        assert_eq!(env_or("NSLIFE_TEST_UNSET_FOR_SURE", 3u32), 3);
    }
}
