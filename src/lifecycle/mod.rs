//! Model lifecycle management
//!
//! Loads and unloads backend handles on demand, serializes concurrent
//! operations per model id, and keeps catalog state aligned with the handle
//! table through a background reconciler.

pub mod handle;
pub mod reconciler;

pub use handle::{GenerationPermit, LoadedModelHandle};
pub use reconciler::Reconciler;

use crate::backend::ModelBackend;
use crate::catalog::ModelCatalog;
use crate::error::{FailureKind, LifecycleError};
use crate::types::{ModelDescriptor, ModelStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Tuning knobs for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum number of simultaneously loaded models
    pub max_loaded_models: usize,
    /// Interval between background reconciliation passes
    pub reconcile_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: 4,
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// Owns the loaded-handle table and serializes per-model operations.
///
/// Locking is per model id: load/unload/delete for the same id are
/// serialized through a dedicated async mutex while operations on other ids
/// proceed concurrently. Reading a handle to generate takes no lock, only a
/// refcount via [`begin_generation`](Self::begin_generation).
pub struct ModelLifecycleManager {
    catalog: Arc<ModelCatalog>,
    backend: Arc<dyn ModelBackend>,
    handles: DashMap<String, Arc<LoadedModelHandle>>,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    config: LifecycleConfig,
}

impl ModelLifecycleManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        backend: Arc<dyn ModelBackend>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            catalog,
            backend,
            handles: DashMap::new(),
            op_locks: DashMap::new(),
            config,
        }
    }

    /// The catalog this manager mutates
    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Number of currently loaded handles
    pub fn loaded_count(&self) -> usize {
        self.handles.len()
    }

    /// Current handle for `id`, if loaded
    pub fn handle(&self, id: &str) -> Option<Arc<LoadedModelHandle>> {
        self.handles.get(id).map(|h| Arc::clone(&h))
    }

    /// Take a generation reference on the loaded model for `id`
    pub fn begin_generation(&self, id: &str) -> Option<GenerationPermit> {
        self.handles.get(id).map(|h| h.acquire())
    }

    fn op_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn require_descriptor(&self, id: &str) -> Result<ModelDescriptor, LifecycleError> {
        self.catalog
            .get(id)
            .ok_or_else(|| LifecycleError::ModelNotFound(id.to_string()))
    }

    /// Mark a model installed. Idempotent.
    pub fn install(&self, id: &str) -> Result<(), LifecycleError> {
        self.require_descriptor(id)?;
        self.catalog.update(id, |d| {
            if !d.installed {
                d.installed = true;
                if d.status == ModelStatus::NotInstalled {
                    d.status = ModelStatus::Installed;
                }
            }
            d.touch();
        });
        Ok(())
    }

    /// Load the model for `id`.
    ///
    /// Returns `Ok(true)` on success (including the already-loaded no-op,
    /// which only refreshes last-activity) and `Ok(false)` when the load was
    /// attempted and failed; the failure classification is recorded on the
    /// descriptor. `Err` only for an unknown id.
    pub async fn load(&self, id: &str) -> Result<bool, LifecycleError> {
        self.require_descriptor(id)?;

        if let Some(handle) = self.handles.get(id) {
            handle.touch();
            self.catalog.update(id, |d| d.touch());
            return Ok(true);
        }

        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        // A concurrent caller may have finished the load while we waited
        if let Some(handle) = self.handles.get(id) {
            handle.touch();
            return Ok(true);
        }

        let descriptor = self.require_descriptor(id)?;

        if self.handles.len() >= self.config.max_loaded_models {
            tracing::warn!(
                "Refusing to load {}: {} models already loaded (max {})",
                id,
                self.handles.len(),
                self.config.max_loaded_models
            );
            self.catalog.update(id, |d| {
                d.status = ModelStatus::Failed;
                d.loaded = false;
                d.record_failure(
                    FailureKind::ResourceExhausted,
                    format!("{} models already loaded", self.handles.len()),
                );
            });
            return Ok(false);
        }

        self.catalog.update(id, |d| {
            d.status = ModelStatus::Loading;
            d.touch();
        });
        tracing::info!("Loading model {}", id);

        match self.backend.load(&descriptor).await {
            Ok(model) => {
                self.handles
                    .insert(id.to_string(), Arc::new(LoadedModelHandle::new(model)));
                self.catalog.update(id, |d| {
                    d.loaded = true;
                    d.status = ModelStatus::Loaded;
                    d.last_error = None;
                    d.touch();
                });
                tracing::info!("Model {} loaded", id);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Load failed for {}: {}", id, e);
                self.catalog.update(id, |d| {
                    d.loaded = false;
                    d.status = ModelStatus::Failed;
                    d.record_failure(FailureKind::LoadFailure, e.to_string());
                });
                Ok(false)
            }
        }
    }

    /// Unload the model for `id`, waiting for in-flight generations first.
    ///
    /// No-op success when not loaded.
    pub async fn unload(&self, id: &str) -> Result<bool, LifecycleError> {
        self.require_descriptor(id)?;

        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let Some(handle) = self.handle(id) else {
            // Nothing resident; make sure the record agrees
            self.catalog.update(id, |d| {
                if d.loaded {
                    d.loaded = false;
                    d.status = if d.installed {
                        ModelStatus::Installed
                    } else {
                        ModelStatus::NotInstalled
                    };
                }
            });
            return Ok(true);
        };

        self.catalog.update(id, |d| {
            d.status = ModelStatus::Unloading;
            d.touch();
        });

        if handle.in_flight() > 0 {
            tracing::info!(
                "Unload of {} waiting on {} in-flight generation(s)",
                id,
                handle.in_flight()
            );
        }
        handle.wait_idle().await;

        self.handles.remove(id);
        self.catalog.update(id, |d| {
            d.loaded = false;
            d.status = if d.installed {
                ModelStatus::Installed
            } else {
                ModelStatus::NotInstalled
            };
            d.touch();
        });
        tracing::info!("Model {} unloaded", id);
        Ok(true)
    }

    /// Record that a generation is executing on `id` (`Loaded → Running`)
    pub fn mark_active(&self, id: &str) -> Result<(), LifecycleError> {
        self.require_descriptor(id)?;
        if let Some(handle) = self.handles.get(id) {
            handle.touch();
        }
        self.catalog.update(id, |d| {
            if d.status == ModelStatus::Loaded {
                d.status = ModelStatus::Running;
            }
            d.touch();
        });
        Ok(())
    }

    /// Record that generation finished on `id` (`Running → Loaded`)
    pub fn mark_idle(&self, id: &str) -> Result<(), LifecycleError> {
        self.require_descriptor(id)?;
        if let Some(handle) = self.handles.get(id) {
            handle.touch();
        }
        self.catalog.update(id, |d| {
            if d.status == ModelStatus::Running {
                d.status = ModelStatus::Loaded;
            }
            d.touch();
        });
        Ok(())
    }

    /// Unload if needed, remove the descriptor, and delete the on-disk
    /// artifact.
    pub async fn delete(&self, id: &str) -> Result<(), LifecycleError> {
        self.require_descriptor(id)?;
        self.unload(id).await?;

        if let Some(descriptor) = self.catalog.remove(id) {
            if let Some(path) = &descriptor.artifact_path {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::info!("Deleted artifact {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("Failed to delete artifact {:?}: {}", path, e),
                }
            }
        }
        self.op_locks.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use std::sync::atomic::Ordering;

    fn manager_with(backend: MockBackend, config: LifecycleConfig) -> Arc<ModelLifecycleManager> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let catalog = Arc::new(ModelCatalog::in_memory());
        Arc::new(ModelLifecycleManager::new(
            catalog,
            Arc::new(backend),
            config,
        ))
    }

    fn register(manager: &ModelLifecycleManager, id: &str) {
        let mut desc = ModelDescriptor::new(id, id.to_uppercase());
        desc.installed = true;
        desc.status = ModelStatus::Installed;
        manager.catalog().register(desc);
    }

    #[tokio::test]
    async fn test_load_then_unload_flags() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        register(&manager, "m1");

        assert!(manager.load("m1").await.unwrap());
        let desc = manager.catalog().get("m1").unwrap();
        assert!(desc.loaded);
        assert_eq!(desc.status, ModelStatus::Loaded);
        assert!(manager.handle("m1").is_some());

        assert!(manager.unload("m1").await.unwrap());
        let desc = manager.catalog().get("m1").unwrap();
        assert!(!desc.loaded);
        assert_eq!(desc.status, ModelStatus::Installed);
        assert!(manager.handle("m1").is_none());
    }

    #[tokio::test]
    async fn test_load_unknown_id_raises() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        assert!(matches!(
            manager.load("ghost").await,
            Err(LifecycleError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_failure_recorded_not_raised() {
        let backend = MockBackend::new(&["hi"]);
        backend.fail_loads_for("m1");
        let manager = manager_with(backend, LifecycleConfig::default());
        register(&manager, "m1");

        assert!(!manager.load("m1").await.unwrap());
        let desc = manager.catalog().get("m1").unwrap();
        assert_eq!(desc.status, ModelStatus::Failed);
        let (kind, _) = desc.last_error.unwrap();
        assert_eq!(kind, FailureKind::LoadFailure);
        assert!(manager.handle("m1").is_none());
    }

    #[tokio::test]
    async fn test_failed_load_is_retryable() {
        let backend = MockBackend::new(&["hi"]);
        backend.fail_loads_for("m1");
        let manager = {
            let catalog = Arc::new(ModelCatalog::in_memory());
            let backend = Arc::new(backend);
            let m = Arc::new(ModelLifecycleManager::new(
                catalog,
                Arc::clone(&backend) as Arc<dyn ModelBackend>,
                LifecycleConfig::default(),
            ));
            register(&m, "m1");
            assert!(!m.load("m1").await.unwrap());
            backend.clear_failure("m1");
            m
        };
        assert!(manager.load("m1").await.unwrap());
        assert_eq!(
            manager.catalog().get("m1").unwrap().status,
            ModelStatus::Loaded
        );
    }

    #[tokio::test]
    async fn test_concurrent_loads_single_backend_call() {
        let backend = MockBackend::new(&["hi"]);
        let catalog = Arc::new(ModelCatalog::in_memory());
        let backend = Arc::new(backend);
        let manager = Arc::new(ModelLifecycleManager::new(
            catalog,
            Arc::clone(&backend) as Arc<dyn ModelBackend>,
            LifecycleConfig::default(),
        ));
        register(&manager, "m1");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.load("m1").await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }
        assert_eq!(backend.load_count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.loaded_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_check_fails_fast() {
        let config = LifecycleConfig {
            max_loaded_models: 1,
            ..Default::default()
        };
        let manager = manager_with(MockBackend::new(&["hi"]), config);
        register(&manager, "m1");
        register(&manager, "m2");

        assert!(manager.load("m1").await.unwrap());
        assert!(!manager.load("m2").await.unwrap());
        let (kind, _) = manager.catalog().get("m2").unwrap().last_error.unwrap();
        assert_eq!(kind, FailureKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_unload_waits_for_in_flight_generation() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        register(&manager, "m1");
        manager.load("m1").await.unwrap();

        let permit = manager.begin_generation("m1").unwrap();
        let unloader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.unload("m1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!unloader.is_finished());
        assert!(manager.handle("m1").is_some());

        drop(permit);
        let done = tokio::time::timeout(Duration::from_millis(500), unloader)
            .await
            .expect("unload should finish")
            .unwrap();
        assert!(done.unwrap());
        assert!(manager.handle("m1").is_none());
    }

    #[tokio::test]
    async fn test_unload_not_loaded_is_noop_success() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        register(&manager, "m1");
        assert!(manager.unload("m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_active_and_idle() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        register(&manager, "m1");
        manager.load("m1").await.unwrap();

        manager.mark_active("m1").unwrap();
        assert_eq!(
            manager.catalog().get("m1").unwrap().status,
            ModelStatus::Running
        );
        // Marking active twice stays Running
        manager.mark_active("m1").unwrap();
        assert_eq!(
            manager.catalog().get("m1").unwrap().status,
            ModelStatus::Running
        );

        manager.mark_idle("m1").unwrap();
        assert_eq!(
            manager.catalog().get("m1").unwrap().status,
            ModelStatus::Loaded
        );
    }

    #[tokio::test]
    async fn test_delete_removes_artifact_and_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("m1.gguf");
        std::fs::write(&artifact, b"weights").unwrap();

        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        let mut desc = ModelDescriptor::new("m1", "M1");
        desc.installed = true;
        desc.status = ModelStatus::Installed;
        desc.artifact_path = Some(artifact.clone());
        manager.catalog().register(desc);
        manager.load("m1").await.unwrap();

        manager.delete("m1").await.unwrap();
        assert!(!artifact.exists());
        assert!(manager.catalog().get("m1").is_none());
        assert!(manager.handle("m1").is_none());
    }

    #[tokio::test]
    async fn test_install_idempotent() {
        let manager = manager_with(MockBackend::new(&["hi"]), LifecycleConfig::default());
        manager.catalog().register(ModelDescriptor::new("m1", "M1"));

        manager.install("m1").unwrap();
        manager.install("m1").unwrap();
        let desc = manager.catalog().get("m1").unwrap();
        assert!(desc.installed);
        assert_eq!(desc.status, ModelStatus::Installed);
    }
}
