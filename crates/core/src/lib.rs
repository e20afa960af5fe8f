//! nslife core types: namespace model, resource kinds, error taxonomy and the
//! store/adapter seams the controller is written against.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

pub mod error;
pub mod fanout;
pub mod names;
pub mod wait;

pub use error::{StoreError, StoreResult};

pub mod prelude {
    pub use super::{
        DeletionAdapter, Finalizers, ItemRef, ListPage, Namespace, NamespaceEvent, NamespaceStore,
        NamespaceUpdate, Phase, ResourceKind, StoreError, StoreResult,
    };
}

/// Coarse lifecycle state of a namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Active,
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Active => f.write_str("Active"),
            Phase::Terminating => f.write_str("Terminating"),
        }
    }
}

/// Kind keys of the adapters that have not yet confirmed an empty namespace.
pub type Finalizers = SmallVec<[String; 4]>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub uid: String,
    pub phase: Phase,
    /// Opaque resource version; compared verbatim on update.
    pub version: String,
    pub creation_ts: i64,
    pub deletion_ts: Option<i64>,
    pub finalizers: Finalizers,
}

impl Namespace {
    pub fn is_terminating(&self) -> bool { self.phase == Phase::Terminating }

    pub fn has_finalizer(&self, key: &str) -> bool { self.finalizers.iter().any(|f| f == key) }
}

/// Mutable part of a namespace record, written with a version check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceUpdate {
    pub phase: Phase,
    pub deletion_ts: Option<i64>,
    pub finalizers: Finalizers,
}

impl NamespaceUpdate {
    pub fn from_current(ns: &Namespace) -> Self {
        Self { phase: ns.phase, deletion_ts: ns.deletion_ts, finalizers: ns.finalizers.clone() }
    }

    pub fn without_finalizer(mut self, key: &str) -> Self {
        self.finalizers.retain(|f| f != key);
        self
    }
}

/// Change notification from the namespace watch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NamespaceEvent {
    Applied(Namespace),
    Deleted(String),
    /// Full relist after a (re)connect.
    Restarted(Vec<Namespace>),
}

/// Group/version/kind of a namespaced resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Core group (`v1`) kind such as pods or services.
    pub fn core(kind: &str) -> Self { Self::new("", "v1", kind) }

    /// Stable key: `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> StoreResult<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(group, version, kind))
            }
            _ => Err(StoreError::Invalid(format!("invalid kind key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// Identity of one item inside a namespace (the kind is implied by the adapter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemRef {
    pub namespace: String,
    pub name: String,
}

/// One page of a list call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPage {
    pub items: Vec<ItemRef>,
    /// Present when more items remain.
    pub continue_token: Option<String>,
}

/// Namespace side of the API store.
#[async_trait::async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn create_namespace(&self, name: &str) -> StoreResult<Namespace>;
    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace>;
    /// List namespaces, optionally only those whose name contains `name_filter`.
    async fn list_namespaces(&self, name_filter: Option<&str>) -> StoreResult<Vec<Namespace>>;
    /// Replace the mutable fields if the stored version still equals `expected_version`.
    async fn update_namespace(&self, name: &str, expected_version: &str, update: NamespaceUpdate) -> StoreResult<Namespace>;
    /// Terminal removal of the namespace object.
    async fn delete_namespace(&self, name: &str) -> StoreResult<()>;
    /// Subscribe to namespace changes. The first event is a `Restarted` listing.
    async fn watch(&self) -> StoreResult<mpsc::Receiver<NamespaceEvent>>;
}

/// Per-kind list/delete capability used by the cascade.
#[async_trait::async_trait]
pub trait DeletionAdapter: Send + Sync {
    fn kind(&self) -> &ResourceKind;

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage>;

    /// Delete one item. `NotFound` means somebody else already removed it.
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// List every item in the namespace, following continue tokens to the end.
    async fn list(&self, namespace: &str, page_size: usize) -> StoreResult<Vec<ItemRef>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(namespace, token.as_deref(), page_size.max(1)).await?;
            out.extend(page.items);
            match page.continue_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }
}

/// Seconds since the unix epoch.
pub fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn kind_key_round_trips_core_and_group() {
        let pods = ResourceKind::core("Pod");
        assert_eq!(pods.key(), "v1/Pod");
        assert_eq!(ResourceKind::parse_key("v1/Pod").unwrap(), pods);
        let deploy = ResourceKind::parse_key("apps/v1/Deployment").unwrap();
        assert_eq!(deploy.group, "apps");
        assert_eq!(deploy.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn kind_key_invalid_returns_err() {
        assert!(ResourceKind::parse_key("invalid").is_err());
        assert!(ResourceKind::parse_key("").is_err());
        assert!(ResourceKind::parse_key("a/b/c/d").is_err());
        assert!(ResourceKind::parse_key("/v1/Pod").is_err());
    }

    #[test]
    fn update_drops_only_named_finalizer() {
        let ns = Namespace {
            name: "a".into(),
            uid: "u".into(),
            phase: Phase::Terminating,
            version: "3".into(),
            creation_ts: 1,
            deletion_ts: Some(2),
            finalizers: SmallVec::from_vec(vec!["v1/Pod".to_string(), "v1/Service".to_string()]),
        };
        let up = NamespaceUpdate::from_current(&ns).without_finalizer("v1/Pod");
        assert_eq!(up.finalizers.as_slice(), ["v1/Service".to_string()]);
        assert_eq!(up.phase, Phase::Terminating);
        assert_eq!(up.deletion_ts, Some(2));
    }

    struct Paged {
        total: usize,
        calls: AtomicUsize,
        kind: ResourceKind,
    }

    #[async_trait::async_trait]
    impl DeletionAdapter for Paged {
        fn kind(&self) -> &ResourceKind { &self.kind }

        async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start: usize = continue_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            let end = (start + limit).min(self.total);
            let items = (start..end).map(|i| ItemRef { namespace: namespace.to_string(), name: format!("item-{}", i) }).collect();
            let continue_token = if end < self.total { Some(end.to_string()) } else { None };
            Ok(ListPage { items, continue_token })
        }

        async fn delete(&self, _namespace: &str, _name: &str) -> StoreResult<()> { Ok(()) }
    }

    #[tokio::test]
    async fn list_follows_continue_tokens_to_the_end() {
        let a = Paged { total: 7, calls: AtomicUsize::new(0), kind: ResourceKind::core("ConfigMap") };
        let items = a.list("ns", 3).await.unwrap();
        assert_eq!(items.len(), 7);
        assert_eq!(items[6].name, "item-6");
        assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn namespace_serializes_phase_by_name() {
        let v = serde_json::to_value(Phase::Terminating).unwrap();
        assert_eq!(v, serde_json::json!("Terminating"));
    }
}
