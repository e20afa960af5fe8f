//! nslife store: in-memory API store.
//!
//! Holds namespaces and namespaced items behind one lock, fans namespace
//! changes out to watchers, and can be told to misbehave (transient faults,
//! injected version conflicts, grace periods on delete) so the controller can
//! be exercised without a cluster.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use metrics::counter;
use nslife_core::names::validate_name;
use nslife_core::prelude::*;
use nslife_core::now_ts;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod adapter;

pub use adapter::MemoryAdapter;

/// Name of the service account created in every new namespace when
/// provisioning is enabled.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

const WATCH_BUFFER: usize = 1024;

pub fn pods() -> ResourceKind { ResourceKind::core("Pod") }
pub fn services() -> ResourceKind { ResourceKind::core("Service") }
pub fn service_accounts() -> ResourceKind { ResourceKind::core("ServiceAccount") }

#[derive(Debug, Clone, Default)]
pub struct MemoryStoreConfig {
    /// Create the default service account this long after a namespace is created.
    pub provision_service_account: Option<Duration>,
}

/// A namespaced object as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub creation_ts: i64,
    /// Delete was requested; the item disappears when its grace period ends.
    pub terminating: bool,
}

struct Stored {
    item: Item,
    grace: Duration,
    gone_at: Option<Instant>,
}

/// Injected failure mode for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindFault {
    pub fail_list: bool,
    pub fail_delete: bool,
}

#[derive(Default)]
struct State {
    namespaces: FxHashMap<String, Namespace>,
    /// kind key -> (namespace, name) -> item; ordered so pages are stable.
    items: FxHashMap<String, BTreeMap<(String, String), Stored>>,
    kinds: BTreeMap<String, ResourceKind>,
    revision: u64,
    watchers: Vec<mpsc::Sender<NamespaceEvent>>,
    faults: FxHashMap<String, KindFault>,
    unavailable: bool,
    conflicts_to_inject: u32,
}

impl State {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn broadcast(&mut self, ev: NamespaceEvent) {
        self.watchers.retain(|tx| match tx.try_send(ev.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("namespace watcher lagging; event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drop items whose grace period has ended.
    fn reap(&mut self, now: Instant) {
        for by_key in self.items.values_mut() {
            by_key.retain(|_, s| s.gone_at.map(|t| t > now).unwrap_or(true));
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable { Err(StoreError::Transient("api store unavailable".into())) } else { Ok(()) }
    }

    fn fault(&self, kind: &ResourceKind) -> KindFault { self.faults.get(&kind.key()).copied().unwrap_or_default() }
}

pub struct MemoryStore {
    state: Mutex<State>,
    config: MemoryStoreConfig,
    me: Weak<MemoryStore>,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self { state: Mutex::new(State::default()), config, me: me.clone() })
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Register a kind so it shows up in `kinds()` even before any item exists.
    pub fn register_kind(&self, kind: &ResourceKind) {
        self.lock().kinds.entry(kind.key()).or_insert_with(|| kind.clone());
    }

    pub fn kinds(&self) -> Vec<ResourceKind> { self.lock().kinds.values().cloned().collect() }

    /// One adapter per registered kind, in kind-key order.
    pub fn adapters(self: &Arc<Self>) -> Vec<MemoryAdapter> {
        self.kinds().into_iter().map(|k| MemoryAdapter::new(self.clone(), k)).collect()
    }

    // ---- fault injection ----

    pub fn set_fault(&self, kind: &ResourceKind, fault: KindFault) {
        let mut g = self.lock();
        if fault == KindFault::default() {
            g.faults.remove(&kind.key());
        } else {
            g.faults.insert(kind.key(), fault);
        }
    }

    pub fn clear_faults(&self) { self.lock().faults.clear(); }

    /// Make every call fail with a transient error until switched back.
    pub fn set_unavailable(&self, on: bool) { self.lock().unavailable = on; }

    /// The next `n` namespace updates behave as if another writer got there
    /// first: the stored version moves and the caller sees a conflict.
    pub fn inject_conflicts(&self, n: u32) { self.lock().conflicts_to_inject = n; }

    // ---- namespaced items ----

    pub fn create_item(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<Item> {
        self.create_item_with_grace(kind, namespace, name, Duration::ZERO)
    }

    /// Create an item that lingers for `grace` after a delete request, like a
    /// pod with a termination grace period.
    pub fn create_item_with_grace(&self, kind: &ResourceKind, namespace: &str, name: &str, grace: Duration) -> StoreResult<Item> {
        validate_name(name)?;
        let mut g = self.lock();
        g.check_available()?;
        match g.namespaces.get(namespace) {
            None => return Err(StoreError::NotFound(format!("namespace {}", namespace))),
            Some(ns) if ns.is_terminating() => {
                return Err(StoreError::Forbidden(format!("namespace {} is being terminated", namespace)))
            }
            Some(_) => {}
        }
        g.reap(Instant::now());
        g.kinds.entry(kind.key()).or_insert_with(|| kind.clone());
        let key = (namespace.to_string(), name.to_string());
        let by_key = g.items.entry(kind.key()).or_default();
        if by_key.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{} {}/{}", kind, namespace, name)));
        }
        let item = Item {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            creation_ts: now_ts(),
            terminating: false,
        };
        by_key.insert(key, Stored { item: item.clone(), grace, gone_at: None });
        counter!("nslife_store_items_created_total", 1, "kind" => kind.key());
        Ok(item)
    }

    pub fn get_item(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<Item> {
        let mut g = self.lock();
        g.check_available()?;
        g.reap(Instant::now());
        g.items
            .get(&kind.key())
            .and_then(|m| m.get(&(namespace.to_string(), name.to_string())))
            .map(|s| s.item.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind, namespace, name)))
    }

    pub fn list_in_namespace(&self, kind: &ResourceKind, namespace: &str) -> StoreResult<Vec<Item>> {
        let mut g = self.lock();
        g.check_available()?;
        g.reap(Instant::now());
        Ok(g
            .items
            .get(&kind.key())
            .map(|m| m.values().filter(|s| s.item.namespace == namespace).map(|s| s.item.clone()).collect())
            .unwrap_or_default())
    }

    /// Items of every kind still present in the namespace.
    pub fn count_in_namespace(&self, namespace: &str) -> usize {
        let mut g = self.lock();
        g.reap(Instant::now());
        g.items.values().map(|m| m.values().filter(|s| s.item.namespace == namespace).count()).sum()
    }

    pub(crate) fn list_page(&self, kind: &ResourceKind, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        let mut g = self.lock();
        g.check_available()?;
        if g.fault(kind).fail_list {
            return Err(StoreError::Transient(format!("list {} in {}: injected fault", kind, namespace)));
        }
        g.reap(Instant::now());
        let Some(by_key) = g.items.get(&kind.key()) else { return Ok(ListPage::default()) };
        let start = (namespace.to_string(), continue_token.unwrap_or("").to_string());
        let mut items: Vec<ItemRef> = by_key
            .range(start..)
            .take_while(|((ns, _), _)| ns == namespace)
            .filter(|((_, name), _)| continue_token.map(|t| name.as_str() > t).unwrap_or(true))
            .take(limit + 1)
            .map(|((ns, name), _)| ItemRef { namespace: ns.clone(), name: name.clone() })
            .collect();
        let continue_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|i| i.name.clone())
        } else {
            None
        };
        Ok(ListPage { items, continue_token })
    }

    pub fn delete_item(&self, kind: &ResourceKind, namespace: &str, name: &str) -> StoreResult<()> {
        let mut g = self.lock();
        g.check_available()?;
        if g.fault(kind).fail_delete {
            return Err(StoreError::Transient(format!("delete {} {}/{}: injected fault", kind, namespace, name)));
        }
        let now = Instant::now();
        g.reap(now);
        let key = (namespace.to_string(), name.to_string());
        let by_key = g.items.get_mut(&kind.key()).ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind, namespace, name)))?;
        let stored = by_key.get_mut(&key).ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind, namespace, name)))?;
        if stored.grace.is_zero() {
            by_key.remove(&key);
        } else if stored.gone_at.is_none() {
            stored.gone_at = Some(now + stored.grace);
            stored.item.terminating = true;
        }
        counter!("nslife_store_items_deleted_total", 1, "kind" => kind.key());
        Ok(())
    }

    fn provision_later(&self, namespace: String, after: Duration) {
        let Some(me) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            match me.create_item(&service_accounts(), &namespace, DEFAULT_SERVICE_ACCOUNT) {
                Ok(_) => debug!(ns = %namespace, "default service account provisioned"),
                // The namespace may already be gone or terminating.
                Err(e) => debug!(ns = %namespace, error = %e, "service account provisioning skipped"),
            }
        });
    }
}

#[async_trait::async_trait]
impl NamespaceStore for MemoryStore {
    async fn create_namespace(&self, name: &str) -> StoreResult<Namespace> {
        validate_name(name)?;
        let ns = {
            let mut g = self.lock();
            g.check_available()?;
            if g.namespaces.contains_key(name) {
                return Err(StoreError::AlreadyExists(format!("namespace {}", name)));
            }
            let ns = Namespace {
                name: name.to_string(),
                uid: uuid::Uuid::new_v4().to_string(),
                phase: Phase::Active,
                version: g.next_version(),
                creation_ts: now_ts(),
                deletion_ts: None,
                finalizers: Finalizers::new(),
            };
            g.namespaces.insert(name.to_string(), ns.clone());
            g.broadcast(NamespaceEvent::Applied(ns.clone()));
            ns
        };
        if let Some(after) = self.config.provision_service_account {
            self.provision_later(name.to_string(), after);
        }
        info!(ns = %name, "namespace created");
        Ok(ns)
    }

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace> {
        let g = self.lock();
        g.check_available()?;
        g.namespaces.get(name).cloned().ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))
    }

    async fn list_namespaces(&self, name_filter: Option<&str>) -> StoreResult<Vec<Namespace>> {
        let g = self.lock();
        g.check_available()?;
        let mut out: Vec<Namespace> =
            g.namespaces.values().filter(|ns| name_filter.map(|f| ns.name.contains(f)).unwrap_or(true)).cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_namespace(&self, name: &str, expected_version: &str, update: NamespaceUpdate) -> StoreResult<Namespace> {
        let mut g = self.lock();
        g.check_available()?;
        if !g.namespaces.contains_key(name) {
            return Err(StoreError::NotFound(format!("namespace {}", name)));
        }
        if g.conflicts_to_inject > 0 {
            g.conflicts_to_inject -= 1;
            let v = g.next_version();
            if let Some(ns) = g.namespaces.get_mut(name) {
                ns.version = v;
            }
            return Err(StoreError::VersionConflict(format!("namespace {}: concurrent writer", name)));
        }
        let current = g.namespaces.get(name).cloned().ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict(format!(
                "namespace {}: expected version {}, found {}",
                name, expected_version, current.version
            )));
        }
        if current.is_terminating() && update.phase == Phase::Active {
            return Err(StoreError::Forbidden(format!("namespace {} cannot leave Terminating", name)));
        }
        let version = g.next_version();
        let next = Namespace { phase: update.phase, deletion_ts: update.deletion_ts, finalizers: update.finalizers, version, ..current };
        g.namespaces.insert(name.to_string(), next.clone());
        g.broadcast(NamespaceEvent::Applied(next.clone()));
        Ok(next)
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        let mut g = self.lock();
        g.check_available()?;
        let ns = g.namespaces.get(name).ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))?;
        if !ns.finalizers.is_empty() {
            return Err(StoreError::Forbidden(format!("namespace {} still has finalizers {:?}", name, ns.finalizers)));
        }
        g.namespaces.remove(name);
        g.broadcast(NamespaceEvent::Deleted(name.to_string()));
        info!(ns = %name, "namespace removed");
        Ok(())
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<NamespaceEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut g = self.lock();
        g.check_available()?;
        let mut all: Vec<Namespace> = g.namespaces.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        let _ = tx.try_send(NamespaceEvent::Restarted(all));
        g.watchers.push(tx);
        Ok(rx)
    }
}

/// Distinct namespaces that still hold at least one item of any kind.
pub fn occupied_namespaces(store: &MemoryStore) -> FxHashSet<String> {
    let mut g = store.lock();
    g.reap(Instant::now());
    g.items.values().flat_map(|m| m.values().map(|s| s.item.namespace.clone())).collect()
}
