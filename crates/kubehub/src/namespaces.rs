//! Namespace store over the API server.
//!
//! The pending-kind set lives in the `nslife.io/pending-kinds` annotation as a
//! JSON list; while it is non-empty the `nslife.io/cascade` metadata finalizer
//! keeps the API server from removing the namespace. `version` is the
//! object's resourceVersion, so replaces are optimistic.

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use nslife_core::names::validate_name;
use nslife_core::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store_error;

pub const PENDING_KINDS_ANNOTATION: &str = "nslife.io/pending-kinds";
pub const CASCADE_FINALIZER: &str = "nslife.io/cascade";

const WATCH_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct KubeNamespaceStore {
    api: Api<KubeNamespace>,
}

impl KubeNamespaceStore {
    pub fn new(client: Client) -> Self { Self { api: Api::all(client) } }

    async fn fetch(&self, name: &str) -> StoreResult<KubeNamespace> {
        self.api.get(name).await.map_err(|e| store_error(e, &format!("get namespace {}", name)))
    }
}

fn parse_pending(name: &str, raw: &str) -> Finalizers {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(keys) => keys.into_iter().collect(),
        Err(e) => {
            warn!(ns = %name, error = %e, "unreadable pending-kinds annotation; ignoring");
            Finalizers::new()
        }
    }
}

/// Convert the API object into the store model.
pub(crate) fn to_namespace(obj: &KubeNamespace) -> StoreResult<Namespace> {
    let meta = &obj.metadata;
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid("namespace object without a name".into()))?;
    let status_terminating = obj.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating");
    let phase = if meta.deletion_timestamp.is_some() || status_terminating { Phase::Terminating } else { Phase::Active };
    let finalizers = meta.annotations.as_ref().and_then(|a| a.get(PENDING_KINDS_ANNOTATION)).map(|raw| parse_pending(&name, raw)).unwrap_or_default();
    Ok(Namespace {
        uid: meta.uid.clone().unwrap_or_default(),
        phase,
        version: meta.resource_version.clone().unwrap_or_default(),
        creation_ts: meta.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0),
        deletion_ts: meta.deletion_timestamp.as_ref().map(|t| t.0.timestamp()),
        finalizers,
        name,
    })
}

/// Write the pending-kind set into the object's annotation and finalizers.
pub(crate) fn apply_pending(meta: &mut ObjectMeta, pending: &Finalizers) -> StoreResult<()> {
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    finalizers.retain(|f| f != CASCADE_FINALIZER);
    if pending.is_empty() {
        annotations.remove(PENDING_KINDS_ANNOTATION);
    } else {
        let raw = serde_json::to_string(pending).map_err(|e| StoreError::Invalid(format!("encoding pending kinds: {}", e)))?;
        annotations.insert(PENDING_KINDS_ANNOTATION.to_string(), raw);
        finalizers.push(CASCADE_FINALIZER.to_string());
    }
    Ok(())
}

fn to_event(ev: Event<KubeNamespace>) -> Option<NamespaceEvent> {
    match ev {
        Event::Applied(o) => to_namespace(&o).ok().map(NamespaceEvent::Applied),
        Event::Deleted(o) => o.metadata.name.map(NamespaceEvent::Deleted),
        Event::Restarted(list) => Some(NamespaceEvent::Restarted(list.iter().filter_map(|o| to_namespace(o).ok()).collect())),
    }
}

#[async_trait::async_trait]
impl NamespaceStore for KubeNamespaceStore {
    async fn create_namespace(&self, name: &str) -> StoreResult<Namespace> {
        validate_name(name)?;
        let obj = KubeNamespace { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() };
        let created = self.api.create(&PostParams::default(), &obj).await.map_err(|e| store_error(e, &format!("create namespace {}", name)))?;
        info!(ns = %name, "namespace created");
        to_namespace(&created)
    }

    async fn get_namespace(&self, name: &str) -> StoreResult<Namespace> { to_namespace(&self.fetch(name).await?) }

    async fn list_namespaces(&self, name_filter: Option<&str>) -> StoreResult<Vec<Namespace>> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| store_error(e, "list namespaces"))?;
        let mut out: Vec<Namespace> = list
            .items
            .iter()
            .filter_map(|o| to_namespace(o).ok())
            .filter(|ns| name_filter.map(|f| ns.name.contains(f)).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// `deletion_ts` in the update is ignored: the API server stamps it when
    /// the delete is issued for the Active -> Terminating move.
    async fn update_namespace(&self, name: &str, expected_version: &str, update: NamespaceUpdate) -> StoreResult<Namespace> {
        let mut obj = self.fetch(name).await?;
        let current = to_namespace(&obj)?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict(format!(
                "namespace {}: expected version {}, found {}",
                name, expected_version, current.version
            )));
        }
        if current.is_terminating() && update.phase == Phase::Active {
            return Err(StoreError::Forbidden(format!("namespace {} cannot leave Terminating", name)));
        }
        apply_pending(&mut obj.metadata, &update.finalizers)?;
        let replaced =
            self.api.replace(name, &PostParams::default(), &obj).await.map_err(|e| store_error(e, &format!("replace namespace {}", name)))?;
        if update.phase == Phase::Terminating && replaced.metadata.deletion_timestamp.is_none() {
            self.api.delete(name, &DeleteParams::background()).await.map_err(|e| store_error(e, &format!("delete namespace {}", name)))?;
            debug!(ns = %name, "delete issued");
            return self.get_namespace(name).await;
        }
        to_namespace(&replaced)
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        let mut obj = self.fetch(name).await?;
        let ns = to_namespace(&obj)?;
        if !ns.finalizers.is_empty() {
            return Err(StoreError::Forbidden(format!("namespace {} still has pending kinds {:?}", name, ns.finalizers)));
        }
        if obj.metadata.finalizers.as_ref().map(|f| f.iter().any(|f| f == CASCADE_FINALIZER)).unwrap_or(false) {
            apply_pending(&mut obj.metadata, &Finalizers::new())?;
            self.api.replace(name, &PostParams::default(), &obj).await.map_err(|e| store_error(e, &format!("release namespace {}", name)))?;
        }
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(ns = %name, "namespace removed");
                Ok(())
            }
            Err(e) => Err(store_error(e, &format!("delete namespace {}", name))),
        }
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<NamespaceEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let api = self.api.clone();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!("namespace watcher started");
            loop {
                match stream.try_next().await {
                    Ok(Some(ev)) => {
                        let Some(ev) = to_event(ev) else { continue };
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Ending the stream makes the tracker reconnect with backoff.
                        counter!("nslife_watch_errors_total", 1);
                        warn!(error = %e, "namespace watcher error");
                        break;
                    }
                }
            }
            warn!("namespace watcher stream ended");
        });
        Ok(rx)
    }
}
