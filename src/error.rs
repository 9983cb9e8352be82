//! Error taxonomy
//!
//! Cross-cutting error types for the lifecycle manager and orchestrator.
//! Backend and storage errors live next to their modules.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification of a recorded failure.
///
/// Lifecycle failures are recorded on the model descriptor and returned as
/// booleans rather than propagated as errors, so the kind travels as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Capacity check failed before the backend load was attempted
    ResourceExhausted,
    /// The backend load primitive returned an error
    LoadFailure,
    /// Generation failed inside the engine
    GenerationFailure,
    /// Reserved: no code path produces this yet (no engine-level timeout exists)
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::ResourceExhausted => "resource exhausted",
            FailureKind::LoadFailure => "load failure",
            FailureKind::GenerationFailure => "generation failure",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Errors raised by the lifecycle manager.
///
/// Only programmer errors raise; operational load/unload failures are
/// recorded on the descriptor and surfaced as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The model id is not present in the catalog
    #[error("unknown model id: {0}")]
    ModelNotFound(String),
}

/// Errors raised by the conversation orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Operating on a conversation id that does not exist
    #[error("unknown conversation: {0}")]
    ConversationNotFound(Uuid),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
