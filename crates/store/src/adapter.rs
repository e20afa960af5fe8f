use std::sync::Arc;

use nslife_core::prelude::*;

use crate::MemoryStore;

/// Deletion adapter for one kind held by a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryAdapter {
    store: Arc<MemoryStore>,
    kind: ResourceKind,
}

impl MemoryAdapter {
    pub fn new(store: Arc<MemoryStore>, kind: ResourceKind) -> Self {
        store.register_kind(&kind);
        Self { store, kind }
    }
}

#[async_trait::async_trait]
impl DeletionAdapter for MemoryAdapter {
    fn kind(&self) -> &ResourceKind { &self.kind }

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        self.store.list_page(&self.kind, namespace, continue_token, limit)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.store.delete_item(&self.kind, namespace, name)
    }
}
