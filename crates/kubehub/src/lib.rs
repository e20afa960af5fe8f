//! nslife kubehub: API-server backed namespace store, discovery of namespaced
//! kinds, and one dynamic deletion adapter per discovered kind.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    core::ApiResource,
    discovery::{verbs, Discovery, Scope},
    Client,
};
use nslife_core::StoreError;
use tracing::{debug, info};

mod adapter;
mod namespaces;

pub use adapter::KubeAdapter;
pub use namespaces::{KubeNamespaceStore, CASCADE_FINALIZER, PENDING_KINDS_ANNOTATION};

/// Kinds that live in a namespace but are never drained by the cascade.
const EXCLUDED_KINDS: &[&str] = &["Namespace", "Event"];

pub async fn client() -> Result<Client> { Client::try_default().await.context("building kube client from the current context") }

/// Map a kube client error onto the store taxonomy by HTTP status.
pub fn store_error(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) => classify_status(ae.code, &ae.reason, format!("{}: {}", what, ae.message)),
        // Transport, TLS and connection failures are worth retrying.
        other => StoreError::Transient(format!("{}: {}", what, other)),
    }
}

pub fn classify_status(code: u16, reason: &str, msg: String) -> StoreError {
    match code {
        404 => StoreError::NotFound(msg),
        409 if reason == "AlreadyExists" => StoreError::AlreadyExists(msg),
        409 => StoreError::VersionConflict(msg),
        429 | 500..=599 => StoreError::Transient(msg),
        _ => StoreError::Permanent(msg),
    }
}

/// Whether a discovered resource should get a deletion adapter.
pub fn cascade_target(kind: &str, namespaced: bool, operations: &[String]) -> bool {
    let supports = |verb: &str| operations.iter().any(|op| op == verb);
    namespaced && supports(verbs::LIST) && supports(verbs::DELETE) && !EXCLUDED_KINDS.contains(&kind)
}

/// Discover served namespaced kinds (incl. CRDs) and build one adapter per
/// kind. Pods and services are always present.
pub async fn discover_adapters(client: Client) -> Result<Vec<KubeAdapter>> {
    let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            if !cascade_target(&ar.kind, namespaced, &caps.operations) {
                debug!(kind = %ar.kind, group = %ar.group, "skipping kind");
                continue;
            }
            let adapter = KubeAdapter::new(client.clone(), ar);
            if seen.insert(adapter.key()) {
                out.push(adapter);
            }
        }
    }
    for ar in [ApiResource::erase::<Pod>(&()), ApiResource::erase::<Service>(&())] {
        let adapter = KubeAdapter::new(client.clone(), ar);
        if seen.insert(adapter.key()) {
            out.push(adapter);
        }
    }
    out.sort_by_key(|a| a.key());
    info!(kinds = out.len(), "discovered deletion adapters");
    Ok(out)
}
