//! Conversation orchestration
//!
//! Owns conversation state, resolves which model serves a request, and
//! glues the lifecycle manager to the generation engine. Generation
//! failures degrade to the engine's canned apology; the conversation is
//! always updated and persisted so callers see a coherent transcript.

use crate::engine::{
    prompt, ChunkCallback, GenerationEngine, GenerationRequest, StopReason, APOLOGY,
};
use crate::error::{FailureKind, OrchestratorError};
use crate::lifecycle::ModelLifecycleManager;
use crate::storage::{CodeBlockProcessor, StorageManager};
use crate::types::{Message, Role, SamplingConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A conversation: ordered message history plus attached metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Model serving this conversation; filled with the default on first
    /// generation if unset or stale
    pub model_id: Option<String>,
    pub messages: Vec<Message>,
    /// Structured attachments (code blocks, stop reasons, ...)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(model_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            model_id,
            messages: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Substituted when a conversation has no usable model id
    pub default_model: String,
    /// Sampling parameters applied to every generation
    pub sampling: SamplingConfig,
}

/// Glues conversations, the lifecycle manager, and the engine together
pub struct ConversationOrchestrator {
    lifecycle: Arc<ModelLifecycleManager>,
    engine: GenerationEngine,
    storage: Arc<dyn StorageManager>,
    code_blocks: Arc<dyn CodeBlockProcessor>,
    conversations: DashMap<Uuid, Conversation>,
    config: OrchestratorConfig,
}

impl ConversationOrchestrator {
    pub fn new(
        lifecycle: Arc<ModelLifecycleManager>,
        storage: Arc<dyn StorageManager>,
        code_blocks: Arc<dyn CodeBlockProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            lifecycle,
            engine: GenerationEngine::new(),
            storage,
            code_blocks,
            conversations: DashMap::new(),
            config,
        }
    }

    /// Create a conversation, optionally pinned to a model
    pub async fn create_conversation(&self, model_id: Option<String>) -> Uuid {
        let conversation = Conversation::new(model_id);
        let id = conversation.id;
        self.storage.save_conversation(&conversation).await;
        self.conversations.insert(id, conversation);
        tracing::info!("Created conversation {}", id);
        id
    }

    /// Snapshot of a conversation
    pub fn conversation(&self, id: Uuid) -> Option<Conversation> {
        self.conversations.get(&id).map(|c| c.clone())
    }

    /// Append a message to a conversation
    pub async fn add_message(
        &self,
        id: Uuid,
        role: Role,
        content: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let snapshot = {
            let mut conversation = self
                .conversations
                .get_mut(&id)
                .ok_or(OrchestratorError::ConversationNotFound(id))?;
            conversation.messages.push(Message::new(role, content));
            conversation.touch();
            conversation.clone()
        };
        self.storage.save_conversation(&snapshot).await;
        Ok(())
    }

    /// Re-pin a conversation to a different model (or clear the pin)
    pub async fn update_conversation_model(
        &self,
        id: Uuid,
        model_id: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let snapshot = {
            let mut conversation = self
                .conversations
                .get_mut(&id)
                .ok_or(OrchestratorError::ConversationNotFound(id))?;
            conversation.model_id = model_id;
            conversation.touch();
            conversation.clone()
        };
        self.storage.save_conversation(&snapshot).await;
        Ok(())
    }

    /// Drop a conversation from the orchestrator
    pub fn delete_conversation(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.conversations
            .remove(&id)
            .map(|_| tracing::info!("Deleted conversation {}", id))
            .ok_or(OrchestratorError::ConversationNotFound(id))
    }

    /// Generate the next assistant message for a conversation.
    ///
    /// The one raising failure is an unknown conversation id; everything
    /// else degrades to an apology message so the transcript stays
    /// coherent. The serving model is marked `Running` for the duration and
    /// restored to `Loaded` afterwards; it is never unloaded here.
    pub async fn generate_response(
        &self,
        id: Uuid,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<Message, OrchestratorError> {
        let recorded_model = self
            .conversations
            .get(&id)
            .ok_or(OrchestratorError::ConversationNotFound(id))?
            .model_id
            .clone();

        // Resolve the serving model, substituting and persisting the
        // default when the recorded id is unset or gone from the catalog
        let catalog = self.lifecycle.catalog();
        let model_id = match recorded_model {
            Some(m) if catalog.contains(&m) => m,
            stale => {
                let fallback = self.config.default_model.clone();
                if let Some(stale) = stale {
                    tracing::warn!(
                        "Conversation {} pinned to unknown model {}, using default {}",
                        id,
                        stale,
                        fallback
                    );
                }
                if let Some(mut conversation) = self.conversations.get_mut(&id) {
                    conversation.model_id = Some(fallback.clone());
                    conversation.touch();
                }
                fallback
            }
        };

        // Ensure the model is resident; if the catalog claims loaded but no
        // handle exists, force one reload attempt before giving up
        let mut permit = None;
        match self.lifecycle.load(&model_id).await {
            Ok(true) => {
                permit = self.lifecycle.begin_generation(&model_id);
                if permit.is_none() {
                    tracing::warn!(
                        "No handle for {} despite successful load, forcing reload",
                        model_id
                    );
                    if matches!(self.lifecycle.load(&model_id).await, Ok(true)) {
                        permit = self.lifecycle.begin_generation(&model_id);
                    }
                }
            }
            Ok(false) => {
                tracing::warn!("Model {} failed to load for conversation {}", model_id, id);
            }
            Err(e) => {
                tracing::warn!("Model {} unavailable: {}", model_id, e);
            }
        }

        let (text, stop_reason) = match permit {
            Some(permit) => {
                // Snapshot the history before marking the model active, so
                // no fallible step sits between mark_active and mark_idle.
                // A conversation deleted during the load is caught here,
                // before the status transition.
                let prompt = {
                    let conversation = self
                        .conversations
                        .get(&id)
                        .ok_or(OrchestratorError::ConversationNotFound(id))?;
                    prompt::build_prompt(&conversation.messages)
                };

                let _ = self.lifecycle.mark_active(&model_id);

                let mut sampling = self.config.sampling.clone();
                // Stop if the model starts a new turn on its own
                for marker in [prompt::USER_MARKER, prompt::SYSTEM_MARKER] {
                    if !sampling.stop.iter().any(|s| s == marker) {
                        sampling.stop.push(marker.to_string());
                    }
                }

                let mut request = GenerationRequest::new(prompt, sampling);
                if let Some(callback) = on_chunk {
                    request = request.with_callback(callback);
                }

                let result = self.engine.generate(permit.model(), request).await;

                if result.stop_reason == StopReason::Error {
                    catalog.update(&model_id, |d| {
                        d.record_failure(
                            FailureKind::GenerationFailure,
                            "generation degraded to the canned reply",
                        );
                    });
                }

                // Cleanup: the model stays warm, back to Loaded
                let _ = self.lifecycle.mark_idle(&model_id);
                drop(permit);

                (result.text, result.stop_reason)
            }
            None => {
                // Unavailable even after the forced reload: same degraded
                // reply the engine would produce
                if let Some(mut callback) = on_chunk {
                    callback(APOLOGY);
                }
                (APOLOGY.to_string(), StopReason::Error)
            }
        };

        let message = Message::new(Role::Assistant, text);
        let blocks = self.code_blocks.process_response(&message.content);

        let snapshot = {
            let mut conversation = self
                .conversations
                .get_mut(&id)
                .ok_or(OrchestratorError::ConversationNotFound(id))?;
            conversation.messages.push(message.clone());
            if let Ok(value) = serde_json::to_value(&blocks) {
                conversation.metadata.insert("code_blocks".to_string(), value);
            }
            if let Ok(value) = serde_json::to_value(stop_reason) {
                conversation
                    .metadata
                    .insert("last_stop_reason".to_string(), value);
            }
            conversation.touch();
            conversation.clone()
        };

        if !self.storage.save_conversation(&snapshot).await {
            tracing::warn!("Failed to persist conversation {}", id);
        }

        Ok(message)
    }
}
