use crate::backend::Backend;
use crate::error::{Result, TempDbError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name-keyed set of provisioning backends. Backends are never removed.
#[derive(Default)]
pub struct Registry {
    backends: RwLock<BTreeMap<String, Arc<dyn Backend>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(TempDbError::InvalidBackendName);
        }
        let mut backends = self.backends.write();
        if backends.contains_key(&name) {
            return Err(TempDbError::DuplicateBackend(name));
        }
        backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(name).cloned()
    }

    /// Like [`Registry::get`], failing with `BackendNotFound`.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.get(name)
            .ok_or_else(|| TempDbError::BackendNotFound(name.to_string()))
    }

    /// Registered names in lexicographic order.
    pub fn names(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    /// Snapshot of every `(name, backend)` pair, in name order.
    pub fn entries(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.backends
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), backend.clone()))
            .collect()
    }
}
