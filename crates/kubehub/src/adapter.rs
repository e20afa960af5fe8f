use kube::{
    api::{Api, DeleteParams, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use nslife_core::prelude::*;
use tracing::trace;

use crate::store_error;

/// Dynamic list/delete adapter for one namespaced kind.
#[derive(Clone)]
pub struct KubeAdapter {
    client: Client,
    resource: ApiResource,
    kind: ResourceKind,
}

impl KubeAdapter {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        let kind = ResourceKind::new(&resource.group, &resource.version, &resource.kind);
        Self { client, resource, kind }
    }

    pub fn key(&self) -> String { self.kind.key() }

    fn api(&self, namespace: &str) -> Api<DynamicObject> { Api::namespaced_with(self.client.clone(), namespace, &self.resource) }
}

#[async_trait::async_trait]
impl DeletionAdapter for KubeAdapter {
    fn kind(&self) -> &ResourceKind { &self.kind }

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        let mut lp = ListParams::default().limit(limit.min(u32::MAX as usize) as u32);
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        let what = format!("list {} in {}", self.kind, namespace);
        let list = self.api(namespace).list(&lp).await.map_err(|e| store_error(e, &what))?;
        let items: Vec<ItemRef> = list
            .items
            .into_iter()
            .filter_map(|o| o.metadata.name)
            .map(|name| ItemRef { namespace: namespace.to_string(), name })
            .collect();
        trace!(ns = %namespace, kind = %self.kind, count = items.len(), "listed page");
        let continue_token = list.metadata.continue_.filter(|t| !t.is_empty());
        Ok(ListPage { items, continue_token })
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let what = format!("delete {} {}/{}", self.kind, namespace, name);
        self.api(namespace).delete(name, &DeleteParams::background()).await.map(|_| ()).map_err(|e| store_error(e, &what))
    }
}
