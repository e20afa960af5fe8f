//! Cascade worker pool: a fixed number of workers pull namespace keys from the
//! work queue and run drain passes until each namespace is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::{counter, gauge, histogram};
use nslife_queue::WorkQueue;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::cascade::{CascadeProgress, Cascader, PassOutcome};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::report::{CascadeReport, CascadeStatus, ReportPublisher, StatusHandle};

enum Retry {
    Waiting,
    Failed { error: String, permanent: bool },
}

pub struct CascadePool {
    cascader: Cascader,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    progress: Mutex<FxHashMap<String, CascadeProgress>>,
    publisher: Mutex<ReportPublisher>,
    completed: AtomicU64,
    failed_passes: AtomicU64,
}

impl CascadePool {
    pub fn new(cascader: Cascader, queue: Arc<WorkQueue>, config: ControllerConfig) -> (Self, StatusHandle) {
        let (publisher, status) = ReportPublisher::new();
        let pool = Self {
            cascader,
            queue,
            config,
            progress: Mutex::new(FxHashMap::default()),
            publisher: Mutex::new(publisher),
            completed: AtomicU64::new(0),
            failed_passes: AtomicU64::new(0),
        };
        (pool, status)
    }

    fn progress(&self) -> MutexGuard<'_, FxHashMap<String, CascadeProgress>> { self.progress.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Run one pass for `key` and decide whether it is finished or goes back
    /// on the queue. The caller must hold `key` from `WorkQueue::get`.
    pub async fn process(&self, key: &str) {
        let existing = self.progress().get(key).cloned();
        let mut progress = match existing {
            Some(p) => p,
            None => {
                counter!("nslife_cascade_started_total", 1);
                CascadeProgress::new(key, self.cascader.registry())
            }
        };

        let outcome = self.cascader.run_pass(&mut progress).await;
        let retry = match outcome {
            Ok(PassOutcome::Done) => {
                let elapsed = progress.started.elapsed();
                self.completed.fetch_add(1, Ordering::Relaxed);
                counter!("nslife_cascade_completed_total", 1);
                histogram!("nslife_cascade_duration_ms", elapsed.as_millis() as f64);
                info!(ns = %key, passes = progress.passes, deleted = progress.deleted, elapsed_ms = elapsed.as_millis() as u64, "cascade complete");
                self.retire(key);
                return;
            }
            Ok(PassOutcome::Retired(reason)) => {
                debug!(ns = %key, reason, "cascade retired");
                self.retire(key);
                return;
            }
            Ok(PassOutcome::Incomplete { progressed, errors, permanent }) => {
                if progressed {
                    self.queue.forget(key);
                }
                if errors.is_empty() {
                    // Items are still going away (grace periods).
                    Retry::Waiting
                } else {
                    Retry::Failed { error: errors.join("; "), permanent }
                }
            }
            Err(e) => {
                progress.last_error = Some(e.to_string());
                Retry::Failed { error: e.to_string(), permanent: !e.is_retryable() }
            }
        };

        // The requeue below counts one more retry. Progress is stored first so
        // a worker picking the key up again sees it.
        let retries = self.queue.info(key).map(|i| i.retries).unwrap_or(0).saturating_add(1);
        self.check_stuck(&mut progress, retries);
        self.progress().insert(key.to_string(), progress);

        match retry {
            Retry::Waiting => {
                let delay = self.queue.requeue_failed(key, "items still terminating");
                trace!(ns = %key, delay_ms = delay.as_millis() as u64, "waiting on terminating items");
            }
            Retry::Failed { error, permanent } => {
                self.failed_passes.fetch_add(1, Ordering::Relaxed);
                counter!("nslife_cascade_failed_pass_total", 1);
                if permanent {
                    let delay = self.queue.backoff().max;
                    self.queue.requeue_after(key, delay, Some(&error));
                    error!(ns = %key, error = %error, delay_ms = delay.as_millis() as u64, "cascade pass failed permanently; retrying at max backoff");
                } else {
                    let delay = self.queue.requeue_failed(key, &error);
                    warn!(ns = %key, error = %error, delay_ms = delay.as_millis() as u64, "cascade pass failed; retrying");
                }
            }
        }
    }

    fn retire(&self, key: &str) {
        self.progress().remove(key);
        self.queue.done(key);
        self.publish_report();
    }

    fn check_stuck(&self, progress: &mut CascadeProgress, retries: u32) {
        if progress.stuck_reported {
            return;
        }
        let elapsed = progress.started.elapsed();
        if retries >= self.config.stuck_after_retries || elapsed >= self.config.stuck_after {
            progress.stuck_reported = true;
            warn!(
                ns = %progress.namespace,
                retries,
                elapsed_secs = elapsed.as_secs(),
                pending = ?progress.pending,
                last_error = progress.last_error.as_deref().unwrap_or(""),
                "cascade stuck"
            );
        }
    }

    /// Build a report from the current progress map and publish it.
    pub fn publish_report(&self) {
        let report = {
            let map = self.progress();
            let cascades: Vec<CascadeStatus> = map
                .values()
                .map(|p| CascadeStatus {
                    namespace: p.namespace.clone(),
                    stage: p.stage,
                    pending_kinds: p.pending.iter().cloned().collect(),
                    passes: p.passes,
                    retries: self.queue.info(&p.namespace).map(|i| i.retries).unwrap_or(0),
                    deleted: p.deleted,
                    elapsed_ms: p.started.elapsed().as_millis() as u64,
                    last_error: p.last_error.clone(),
                    stuck: p.stuck_reported,
                })
                .collect();
            let stuck = cascades.iter().filter(|c| c.stuck).count();
            CascadeReport {
                epoch: 0,
                cascades,
                stuck,
                completed: self.completed.load(Ordering::Relaxed),
                failed_passes: self.failed_passes.load(Ordering::Relaxed),
            }
        };
        gauge!("nslife_stuck_namespaces", report.stuck as f64);
        self.publisher.lock().unwrap_or_else(|p| p.into_inner()).publish(report);
    }

    /// Pull keys until the queue shuts down. A queue that closes without
    /// `shutdown` being set is an error so the process restarts and resumes.
    pub async fn run_worker(self: Arc<Self>, id: usize, shutdown: watch::Receiver<bool>) -> Result<()> {
        debug!(worker = id, "cascade worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
        }
        if !*shutdown.borrow() {
            error!(worker = id, "work queue closed while running");
            return Err(ControllerError::QueueClosed);
        }
        debug!(worker = id, "cascade worker stopped");
        Ok(())
    }

    /// Refresh the report on a fixed interval so elapsed times and stuck
    /// flags stay current while workers are blocked in backoff.
    pub async fn run_reporter(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.report_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_report(),
                _ = shutdown.changed() => break,
            }
        }
        self.publish_report();
    }
}
