//! One drain pass over a terminating namespace: run every pending adapter,
//! release the finalizers of adapters that confirmed an empty namespace, and
//! remove the namespace once nothing is left.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use metrics::counter;
use nslife_core::prelude::*;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::AdapterRegistry;

const MAX_CONFLICT_RETRIES: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// Queued, no pass has run yet.
    Pending,
    Draining,
    /// Every adapter confirmed; only the namespace record is left.
    Finalizing,
    Done,
}

/// In-memory progress of one cascade. Lost on restart, in which case every
/// adapter simply runs again.
#[derive(Debug, Clone)]
pub struct CascadeProgress {
    pub namespace: String,
    pub stage: Stage,
    /// Kind keys that have not confirmed an empty namespace yet.
    pub pending: BTreeSet<String>,
    /// Per kind, items already asked to go that were still listed last pass.
    /// They are not deleted or counted again while they terminate.
    pub requested: BTreeMap<String, BTreeSet<String>>,
    pub started: Instant,
    pub passes: u32,
    pub deleted: u64,
    pub last_error: Option<String>,
    pub stuck_reported: bool,
}

impl CascadeProgress {
    pub fn new(namespace: &str, registry: &AdapterRegistry) -> Self {
        Self {
            namespace: namespace.to_string(),
            stage: Stage::Pending,
            pending: registry.keys().into_iter().collect(),
            requested: BTreeMap::new(),
            started: Instant::now(),
            passes: 0,
            deleted: 0,
            last_error: None,
            stuck_reported: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Namespace removed.
    Done,
    /// Nothing to do: the namespace is gone or not terminating.
    Retired(&'static str),
    Incomplete { progressed: bool, errors: Vec<String>, permanent: bool },
}

struct Drained {
    deleted: u64,
    /// Items requested on an earlier pass that are gone now.
    vanished: usize,
    empty: bool,
}

pub struct Cascader {
    store: Arc<dyn NamespaceStore>,
    registry: AdapterRegistry,
    adapter_concurrency: usize,
    page_size: usize,
}

impl Cascader {
    pub fn new(store: Arc<dyn NamespaceStore>, registry: AdapterRegistry, adapter_concurrency: usize, page_size: usize) -> Self {
        Self { store, registry, adapter_concurrency: adapter_concurrency.max(1), page_size: page_size.max(1) }
    }

    pub fn registry(&self) -> &AdapterRegistry { &self.registry }

    /// Run one pass. `Err` means the namespace record itself could not be
    /// read; adapter failures are reported through `PassOutcome::Incomplete`.
    pub async fn run_pass(&self, progress: &mut CascadeProgress) -> StoreResult<PassOutcome> {
        let name = progress.namespace.clone();
        progress.passes += 1;
        let ns = match self.store.get_namespace(&name).await {
            Ok(ns) => ns,
            Err(e) if e.is_not_found() => return Ok(PassOutcome::Retired("namespace gone")),
            Err(e) => return Err(e),
        };
        if !ns.is_terminating() {
            return Ok(PassOutcome::Retired("namespace not terminating"));
        }
        if progress.stage == Stage::Pending {
            // Finalizers are the durable record: kinds whose finalizer is gone
            // were confirmed by an earlier process. With none of ours present
            // there is no record and every kind runs.
            if progress.pending.iter().any(|k| ns.has_finalizer(k)) {
                progress.pending.retain(|k| ns.has_finalizer(k));
            }
            progress.stage = Stage::Draining;
            info!(ns = %name, kinds = progress.pending.len(), "cascade started");
        }

        let mut errors = Vec::new();
        let mut permanent = false;
        let mut progressed = false;

        if progress.stage == Stage::Draining {
            let mut adapters = Vec::with_capacity(progress.pending.len());
            for key in &progress.pending {
                if let Some(a) = self.registry.get(key) {
                    adapters.push((a.clone(), progress.requested.remove(key).unwrap_or_default()));
                }
            }
            let drains: Vec<_> = adapters.into_iter().map(|(a, mut requested)| {
                let name = name.clone();
                async move {
                    let res = self.drain(a.as_ref(), &name, &mut requested).await;
                    (a.kind().key(), requested, res)
                }
            }).collect();
            let results: Vec<(String, BTreeSet<String>, StoreResult<Drained>)> = stream::iter(drains)
            .buffer_unordered(self.adapter_concurrency)
            .collect()
            .await;

            let mut confirmed = Vec::new();
            for (key, requested, res) in results {
                if !requested.is_empty() {
                    progress.requested.insert(key.clone(), requested);
                }
                match res {
                    Ok(d) => {
                        progress.deleted += d.deleted;
                        progressed |= d.deleted > 0 || d.vanished > 0;
                        if d.empty {
                            confirmed.push(key);
                        }
                    }
                    Err(e) => {
                        permanent |= !e.is_retryable();
                        errors.push(format!("{}: {}", key, e));
                    }
                }
            }

            if !confirmed.is_empty() {
                match self.release(&name, &confirmed).await {
                    Ok(()) => {
                        for key in &confirmed {
                            progress.pending.remove(key);
                            progress.requested.remove(key);
                        }
                        progressed = true;
                        debug!(ns = %name, kinds = ?confirmed, "adapters confirmed empty");
                    }
                    Err(e) if e.is_not_found() => return Ok(PassOutcome::Retired("namespace gone")),
                    Err(e) => {
                        permanent |= !e.is_retryable();
                        errors.push(format!("release finalizers: {}", e));
                    }
                }
            }
            if progress.pending.is_empty() {
                progress.stage = Stage::Finalizing;
            }
        }

        if progress.stage == Stage::Finalizing {
            match self.finalize(&name).await {
                Ok(()) => {
                    progress.stage = Stage::Done;
                    return Ok(PassOutcome::Done);
                }
                Err(e) => {
                    permanent |= !e.is_retryable();
                    errors.push(format!("remove namespace: {}", e));
                }
            }
        }

        if let Some(first) = errors.first() {
            progress.last_error = Some(first.clone());
        }
        Ok(PassOutcome::Incomplete { progressed, errors, permanent })
    }

    /// Delete every item the adapter lists, then list again to confirm the
    /// namespace is empty for this kind. Items already gone are skipped, and
    /// so are items in `requested`, which were deleted on an earlier pass and
    /// are still terminating. `requested` is left holding the names asked to
    /// go that were still listed at the end of the pass.
    async fn drain(&self, adapter: &dyn DeletionAdapter, namespace: &str, requested: &mut BTreeSet<String>) -> StoreResult<Drained> {
        let kind = adapter.kind().key();
        let items = adapter.list(namespace, self.page_size).await?;
        let before = requested.len();
        requested.retain(|n| items.iter().any(|i| &i.name == n));
        let vanished = before - requested.len();
        if items.is_empty() {
            return Ok(Drained { deleted: 0, vanished, empty: true });
        }
        let mut deleted = 0u64;
        let mut first_err = None;
        for item in &items {
            if requested.contains(&item.name) {
                continue;
            }
            match adapter.delete(namespace, &item.name).await {
                Ok(()) => {
                    deleted += 1;
                    requested.insert(item.name.clone());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(ns = %namespace, kind = %kind, item = %item.name, error = %e, "delete failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if deleted > 0 {
            counter!("nslife_items_deleted_total", deleted, "kind" => kind.clone());
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        let left = adapter.list(namespace, self.page_size).await?;
        requested.retain(|n| left.iter().any(|i| &i.name == n));
        debug!(ns = %namespace, kind = %kind, deleted, left = left.len(), terminating = requested.len(), "drained");
        Ok(Drained { deleted, vanished, empty: left.is_empty() })
    }

    /// Drop `keys` from the namespace finalizers with a version-checked update.
    async fn release(&self, name: &str, keys: &[String]) -> StoreResult<()> {
        self.rewrite_finalizers(name, |f| !keys.contains(f)).await.map(|_| ())
    }

    /// Clear whatever finalizers remain and remove the namespace record.
    async fn finalize(&self, name: &str) -> StoreResult<()> {
        let dropped = match self.rewrite_finalizers(name, |_| false).await {
            Ok(dropped) => dropped,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !dropped.is_empty() {
            warn!(ns = %name, finalizers = ?dropped, "clearing finalizers with no registered adapter");
        }
        match self.store.delete_namespace(name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                info!(ns = %name, "namespace finalized");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Keep only finalizers matching `keep`; returns the ones dropped.
    async fn rewrite_finalizers<F>(&self, name: &str, keep: F) -> StoreResult<Vec<String>>
    where
        F: Fn(&String) -> bool,
    {
        let mut conflicts = 0u32;
        loop {
            let ns = self.store.get_namespace(name).await?;
            let dropped: Vec<String> = ns.finalizers.iter().filter(|f| !keep(f)).cloned().collect();
            if dropped.is_empty() {
                return Ok(dropped);
            }
            let mut update = NamespaceUpdate::from_current(&ns);
            update.finalizers.retain(|f| keep(f));
            match self.store.update_namespace(name, &ns.version, update).await {
                Ok(_) => return Ok(dropped),
                Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
