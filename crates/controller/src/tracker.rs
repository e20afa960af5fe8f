//! Namespace phase tracker: Active -> Terminating transitions and the watch
//! loop that hands terminating namespaces to the cascade queue.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use nslife_core::prelude::*;
use nslife_core::now_ts;
use nslife_queue::WorkQueue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;

const MAX_CONFLICT_RETRIES: u32 = 16;

/// Mark `name` Terminating and seed its finalizers. Already terminating
/// namespaces are returned unchanged (missing seed finalizers are not
/// re-added). Version conflicts are retried against a fresh read, a bounded
/// number of times.
pub async fn mark_terminating(store: &dyn NamespaceStore, name: &str, seed: &Finalizers) -> StoreResult<Namespace> {
    let mut conflicts = 0u32;
    loop {
        let current = store.get_namespace(name).await?;
        if current.is_terminating() {
            return Ok(current);
        }
        let mut update = NamespaceUpdate::from_current(&current);
        update.phase = Phase::Terminating;
        update.deletion_ts = Some(now_ts());
        for key in seed {
            if !update.finalizers.contains(key) {
                update.finalizers.push(key.clone());
            }
        }
        match store.update_namespace(name, &current.version, update).await {
            Ok(ns) => {
                info!(ns = %name, conflicts, "namespace marked terminating");
                counter!("nslife_deletions_requested_total", 1);
                return Ok(ns);
            }
            Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                conflicts += 1;
                debug!(ns = %name, conflicts, "version conflict; re-reading");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct PhaseTracker {
    store: Arc<dyn NamespaceStore>,
    queue: Arc<WorkQueue>,
    seed: Finalizers,
    resync: Duration,
}

impl PhaseTracker {
    pub fn new(store: Arc<dyn NamespaceStore>, queue: Arc<WorkQueue>, seed: Finalizers, resync: Duration) -> Self {
        Self { store, queue, seed, resync }
    }

    /// Request deletion of a namespace. NotFound if it does not exist; a
    /// repeated request on a terminating namespace is a no-op.
    pub async fn request_deletion(&self, name: &str) -> StoreResult<Namespace> {
        let ns = mark_terminating(self.store.as_ref(), name, &self.seed).await?;
        self.enqueue(&ns);
        Ok(ns)
    }

    pub async fn get(&self, name: &str) -> StoreResult<Phase> { self.store.get_namespace(name).await.map(|ns| ns.phase) }

    fn enqueue(&self, ns: &Namespace) {
        if ns.is_terminating() && self.queue.add(&ns.name) {
            debug!(ns = %ns.name, "cascade queued");
        }
    }

    pub fn observe(&self, ev: &NamespaceEvent) {
        match ev {
            NamespaceEvent::Applied(ns) => self.enqueue(ns),
            NamespaceEvent::Restarted(all) => {
                let terminating = all.iter().filter(|ns| ns.is_terminating()).count();
                debug!(total = all.len(), terminating, "watch restart");
                for ns in all {
                    self.enqueue(ns);
                }
            }
            NamespaceEvent::Deleted(name) => debug!(ns = %name, "namespace gone"),
        }
    }

    /// List everything and queue every terminating namespace. Used at startup
    /// to resume work left by a previous process, and periodically after.
    pub async fn resync(&self) -> StoreResult<usize> {
        let all = self.store.list_namespaces(None).await?;
        let mut queued = 0;
        for ns in all.iter().filter(|ns| ns.is_terminating()) {
            if self.queue.add(&ns.name) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "resync queued terminating namespaces");
        }
        Ok(queued)
    }

    /// Watch namespaces until `shutdown` flips to true. Watch failures are
    /// retried with the queue's backoff; they never stop the tracker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.resync().await {
            warn!(error = %e, "initial resync failed; relying on watch");
        }
        let mut attempt = 0u32;
        let mut ticker = tokio::time::interval(self.resync);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let mut rx = match self.store.watch().await {
                Ok(rx) => {
                    attempt = 0;
                    rx
                }
                Err(e) => {
                    let delay = self.queue.backoff().delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "namespace watch failed; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            };
            info!("namespace watch started");
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) => self.observe(&ev),
                        None => {
                            warn!("namespace watch ended; reconnecting");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "resync failed");
                        }
                    }
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
    }
}
