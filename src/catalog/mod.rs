//! Model catalog
//!
//! Descriptor table keyed by model id, rewritten to disk after every
//! mutating operation. Loaded handles live elsewhere (the lifecycle
//! manager); the catalog only records what should be true.

pub mod fetch;

use crate::storage::{get_data_dir, StorageError};
use crate::types::ModelDescriptor;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Catalog of model descriptors.
///
/// All mutations go through [`register`](Self::register),
/// [`update`](Self::update), and [`remove`](Self::remove) so the on-disk
/// copy stays current. Persistence failures are logged and do not abort the
/// calling operation.
pub struct ModelCatalog {
    descriptors: DashMap<String, ModelDescriptor>,
    path: Option<PathBuf>,
}

impl ModelCatalog {
    /// Catalog without a backing file (tests, ephemeral use)
    pub fn in_memory() -> Self {
        Self {
            descriptors: DashMap::new(),
            path: None,
        }
    }

    /// Open a catalog backed by `path`, reading it if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let descriptors = DashMap::new();
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let map: BTreeMap<String, ModelDescriptor> = serde_json::from_str(&json)?;
            for (id, descriptor) in map {
                descriptors.insert(id, descriptor);
            }
            tracing::info!("Loaded {} model descriptors from {:?}", descriptors.len(), path);
        }
        Ok(Self {
            descriptors,
            path: Some(path),
        })
    }

    /// Open the catalog at its default location under the data directory
    pub fn open_default() -> Result<Self, StorageError> {
        Self::open(get_data_dir()?.join("models.json"))
    }

    /// Register a descriptor, replacing any existing one with the same id
    pub fn register(&self, descriptor: ModelDescriptor) {
        tracing::info!("Registering model {}", descriptor.id);
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        self.persist();
    }

    /// Snapshot of a descriptor by id
    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.descriptors.get(id).map(|d| d.clone())
    }

    /// Whether `id` is present
    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.contains_key(id)
    }

    /// Snapshot of all descriptors
    pub fn list(&self) -> Vec<ModelDescriptor> {
        self.descriptors.iter().map(|d| d.clone()).collect()
    }

    /// All registered ids
    pub fn ids(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.key().clone()).collect()
    }

    /// Mutate a descriptor in place; returns false if `id` is unknown
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ModelDescriptor),
    {
        let found = match self.descriptors.get_mut(id) {
            Some(mut entry) => {
                mutate(&mut entry);
                true
            }
            None => false,
        };
        if found {
            self.persist();
        }
        found
    }

    /// Remove a descriptor, returning it if present
    pub fn remove(&self, id: &str) -> Option<ModelDescriptor> {
        let removed = self.descriptors.remove(id).map(|(_, d)| d);
        if removed.is_some() {
            tracing::info!("Removed model {} from catalog", id);
            self.persist();
        }
        removed
    }

    /// Number of registered models
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Rewrite the backing file, if any. Sorted map for stable diffs.
    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let map: BTreeMap<String, ModelDescriptor> = self
            .descriptors
            .iter()
            .map(|d| (d.key().clone(), d.clone()))
            .collect();
        let result = (|| -> Result<(), StorageError> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&map)?;
            fs::write(path, json)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!("Failed to persist model catalog to {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelStatus;

    #[test]
    fn test_register_and_get() {
        let catalog = ModelCatalog::in_memory();
        catalog.register(ModelDescriptor::new("m1", "Model One"));
        let desc = catalog.get("m1").unwrap();
        assert_eq!(desc.display_name, "Model One");
        assert!(catalog.contains("m1"));
        assert!(!catalog.contains("m2"));
    }

    #[test]
    fn test_update_unknown_id() {
        let catalog = ModelCatalog::in_memory();
        assert!(!catalog.update("ghost", |d| d.installed = true));
    }

    #[test]
    fn test_update_mutates() {
        let catalog = ModelCatalog::in_memory();
        catalog.register(ModelDescriptor::new("m1", "Model One"));
        assert!(catalog.update("m1", |d| {
            d.installed = true;
            d.status = ModelStatus::Installed;
        }));
        let desc = catalog.get("m1").unwrap();
        assert!(desc.installed);
        assert_eq!(desc.status, ModelStatus::Installed);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        {
            let catalog = ModelCatalog::open(&path).unwrap();
            catalog.register(ModelDescriptor::new("m1", "Model One"));
            catalog.update("m1", |d| d.installed = true);
        }
        let reopened = ModelCatalog::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("m1").unwrap().installed);
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        let catalog = ModelCatalog::open(&path).unwrap();
        catalog.register(ModelDescriptor::new("m1", "Model One"));
        assert!(catalog.remove("m1").is_some());
        assert!(catalog.remove("m1").is_none());
        let reopened = ModelCatalog::open(&path).unwrap();
        assert!(reopened.is_empty());
    }
}
