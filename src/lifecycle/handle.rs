//! Loaded model handles
//!
//! A handle pairs the backend model with an in-flight generation refcount.
//! Unload waits on the refcount reaching zero, so a model is never released
//! out from under a running generation.

use crate::backend::TextModel;
use crate::types::message::unix_now;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// In-memory reference to a loaded model ready to generate
pub struct LoadedModelHandle {
    model: Arc<dyn TextModel>,
    in_flight: AtomicUsize,
    last_activity: AtomicU64,
    idle: Notify,
}

impl LoadedModelHandle {
    pub(crate) fn new(model: Arc<dyn TextModel>) -> Self {
        Self {
            model,
            in_flight: AtomicUsize::new(0),
            last_activity: AtomicU64::new(unix_now()),
            idle: Notify::new(),
        }
    }

    /// Shared reference to the backend model
    pub fn model(&self) -> Arc<dyn TextModel> {
        Arc::clone(&self.model)
    }

    /// Number of generations currently holding this handle
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Unix timestamp of the last activity on this handle
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Refresh the last-activity stamp
    pub fn touch(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    /// Take a generation reference on this handle
    pub fn acquire(self: &Arc<Self>) -> GenerationPermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        GenerationPermit {
            handle: Arc::clone(self),
        }
    }

    /// Wait until no generation holds this handle.
    ///
    /// Registers for notification before checking the count, so a permit
    /// dropped between the check and the await is not missed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard for one in-flight generation.
///
/// Dropping the permit releases the reference and wakes any unload waiting
/// for the handle to go idle.
pub struct GenerationPermit {
    handle: Arc<LoadedModelHandle>,
}

impl GenerationPermit {
    /// The model this permit protects
    pub fn model(&self) -> Arc<dyn TextModel> {
        self.handle.model()
    }
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.handle.touch();
        if self.handle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handle.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockModel;
    use std::time::Duration;

    fn handle() -> Arc<LoadedModelHandle> {
        Arc::new(LoadedModelHandle::new(Arc::new(MockModel::scripted(&[
            "hi",
        ]))))
    }

    #[test]
    fn test_permit_refcount() {
        let h = handle();
        assert_eq!(h.in_flight(), 0);
        let p1 = h.acquire();
        let p2 = h.acquire();
        assert_eq!(h.in_flight(), 2);
        drop(p1);
        assert_eq!(h.in_flight(), 1);
        drop(p2);
        assert_eq!(h.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_free() {
        let h = handle();
        tokio::time::timeout(Duration::from_millis(50), h.wait_idle())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_permit_dropped() {
        let h = handle();
        let permit = h.acquire();

        let waiter = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.wait_idle().await })
        };

        // Still held: the waiter must not complete yet
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
