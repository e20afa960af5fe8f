//! Ordered, append-only set of deletion adapters assembled at startup.

use std::sync::Arc;

use nslife_core::{DeletionAdapter, Finalizers};
use rustc_hash::FxHashSet;

use crate::error::{ControllerError, Result};

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn DeletionAdapter>>,
}

impl AdapterRegistry {
    pub fn builder() -> RegistryBuilder { RegistryBuilder::default() }

    pub fn len(&self) -> usize { self.adapters.len() }

    pub fn is_empty(&self) -> bool { self.adapters.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeletionAdapter>> { self.adapters.iter() }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn DeletionAdapter>> { self.adapters.iter().find(|a| a.kind().key() == key) }

    /// Kind keys in registration order.
    pub fn keys(&self) -> Vec<String> { self.adapters.iter().map(|a| a.kind().key()).collect() }

    /// Finalizer set seeded onto a namespace when it starts terminating.
    pub fn finalizers(&self) -> Finalizers { self.keys().into_iter().collect() }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("kinds", &self.keys()).finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    adapters: Vec<Arc<dyn DeletionAdapter>>,
    seen: FxHashSet<String>,
}

impl RegistryBuilder {
    pub fn register<A: DeletionAdapter + 'static>(self, adapter: A) -> Result<Self> { self.register_arc(Arc::new(adapter)) }

    pub fn register_arc(mut self, adapter: Arc<dyn DeletionAdapter>) -> Result<Self> {
        let key = adapter.kind().key();
        if !self.seen.insert(key.clone()) {
            return Err(ControllerError::DuplicateAdapter(key));
        }
        self.adapters.push(adapter);
        Ok(self)
    }

    pub fn build(self) -> AdapterRegistry { AdapterRegistry { adapters: self.adapters } }
}
