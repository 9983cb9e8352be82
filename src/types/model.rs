//! Model types
//!
//! Catalog descriptors and runtime status for installable models.

use crate::error::FailureKind;
use crate::types::message::unix_now;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime status of a model, as recorded on its descriptor.
///
/// Transitions: `NotInstalled → Installed → Loading → Loaded ⇄ Running →
/// Unloading → Installed`, with `Loading → Failed` on error. `Failed` is
/// retryable by calling load again; there is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    /// Registered but no artifact installed
    NotInstalled,
    /// Artifact present, not resident in memory
    Installed,
    /// A load is in progress
    Loading,
    /// Resident and idle
    Loaded,
    /// Resident with a generation currently executing
    Running,
    /// An unload is in progress
    Unloading,
    /// The last load attempt failed
    Failed,
}

/// Resource hints attached to a descriptor.
///
/// Advisory only; the capacity policy and the engine's truncation logic
/// consume these, the backend is free to ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Approximate resident memory needed once loaded, in MB
    pub approx_ram_mb: u64,
    /// Context window in tokens
    pub context_window: usize,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            approx_ram_mb: 4096,
            context_window: 4096,
        }
    }
}

/// Catalog record describing an installable/loadable model.
///
/// Mutated by the lifecycle manager and persisted by the catalog on every
/// mutation. The `loaded` flag is eventually consistent with the handle
/// table; the background reconciler closes any gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier, unique within the catalog
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Whether an artifact is installed on disk
    pub installed: bool,
    /// Whether the catalog believes a handle is resident
    pub loaded: bool,
    /// Current runtime status
    pub status: ModelStatus,
    /// Unix timestamp (seconds) of the last lifecycle or generation activity
    pub last_activity: u64,
    /// Advisory resource hints
    #[serde(default)]
    pub hints: ResourceHints,
    /// On-disk artifact, if any; removed by delete
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
    /// Classification and message of the most recent recorded failure
    #[serde(default)]
    pub last_error: Option<(FailureKind, String)>,
}

impl ModelDescriptor {
    /// Create a descriptor for a newly registered model
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            installed: false,
            loaded: false,
            status: ModelStatus::NotInstalled,
            last_activity: unix_now(),
            hints: ResourceHints::default(),
            artifact_path: None,
            last_error: None,
        }
    }

    /// Refresh the last-activity stamp
    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }

    /// Record a failure classification, replacing any previous one
    pub fn record_failure(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.last_error = Some((kind, message.into()));
        self.touch();
    }
}
