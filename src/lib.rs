//! emberlm
//!
//! Local language-model serving core: a persisted model catalog, a
//! lifecycle manager with background reconciliation, a streaming
//! generation engine with nucleus sampling, and a conversation
//! orchestrator tying them together. Model numerics live behind the
//! [`backend`] traits; see [`backend::mock`] for a weights-free backend.

pub mod backend;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod storage;
pub mod types;

pub use backend::{BackendCapability, ModelBackend, TextModel};
pub use catalog::ModelCatalog;
pub use engine::{GenerationEngine, GenerationRequest, GenerationResult, StopReason};
pub use error::{FailureKind, LifecycleError, OrchestratorError};
pub use lifecycle::{LifecycleConfig, ModelLifecycleManager, Reconciler};
pub use orchestrator::{Conversation, ConversationOrchestrator, OrchestratorConfig};
pub use types::{Message, ModelDescriptor, ModelStatus, Role, SamplingConfig};
