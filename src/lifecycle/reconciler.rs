//! Background reconciliation
//!
//! Periodically aligns recorded descriptor state with the loaded-handle
//! table. The task is owned: it has an explicit stop signal and is joined
//! on shutdown rather than left free-running.

use super::ModelLifecycleManager;
use crate::types::ModelStatus;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

impl ModelLifecycleManager {
    /// One reconciliation pass. Idempotent: with no external change, a
    /// second consecutive pass performs zero mutations.
    ///
    /// Returns the number of repairs performed. Errors during individual
    /// repairs are logged and never surfaced.
    pub async fn reconcile_once(self: &Arc<Self>) -> usize {
        let mut mutations = 0usize;

        // Descriptors that claim a resident model with no handle behind
        // them: attempt a real load.
        for descriptor in self.catalog().list() {
            if descriptor.loaded && self.handle(&descriptor.id).is_none() {
                tracing::info!(
                    "Reconcile: {} marked loaded without a handle, reloading",
                    descriptor.id
                );
                match self.load(&descriptor.id).await {
                    Ok(_) => mutations += 1,
                    Err(e) => tracing::warn!("Reconcile load of {} failed: {}", descriptor.id, e),
                }
            }
        }

        // Handles whose descriptor disagrees or disappeared.
        let resident: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        for id in resident {
            match self.catalog().get(&id) {
                Some(descriptor) if !descriptor.loaded => {
                    tracing::info!("Reconcile: {} has a handle but is marked unloaded", id);
                    self.catalog().update(&id, |d| {
                        d.loaded = true;
                        if d.status != ModelStatus::Running {
                            d.status = ModelStatus::Loaded;
                        }
                    });
                    mutations += 1;
                }
                Some(_) => {}
                None => {
                    tracing::info!("Reconcile: dropping handle for unknown model {}", id);
                    if let Some(handle) = self.handle(&id) {
                        handle.wait_idle().await;
                    }
                    self.handles.remove(&id);
                    self.op_locks.remove(&id);
                    mutations += 1;
                }
            }
        }

        if mutations > 0 {
            tracing::debug!("Reconcile pass performed {} repair(s)", mutations);
        }
        mutations
    }

    /// Start the periodic reconciliation task.
    ///
    /// The returned [`Reconciler`] owns the task; call
    /// [`Reconciler::stop`] to shut it down cleanly.
    pub fn start_reconciler(self: &Arc<Self>) -> Reconciler {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = manager.config.reconcile_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a freshly started
            // manager is not reconciled before callers finish wiring up.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reconcile_once().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Reconciler stopped");
        });

        Reconciler {
            stop: stop_tx,
            task: Some(task),
        }
    }
}

/// Handle to the running reconciliation task
pub struct Reconciler {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Signal the task to stop and wait for it to finish
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        // Backstop if stop() was never awaited
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
