//! Model backend abstraction
//!
//! The numerics of the underlying model are opaque to this crate. A backend
//! turns an installed artifact into a [`TextModel`], and each loaded model
//! declares one of a closed set of decode capabilities chosen at load time.

pub mod mock;

use crate::types::{ModelDescriptor, SamplingConfig};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Token identifier in the backend's vocabulary
pub type TokenId = u32;

/// How a loaded model produces text.
///
/// Selected once when the handle is created; the engine dispatches on it
/// instead of string-tagged backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCapability {
    /// The backend exposes an incremental-decode primitive; the engine only
    /// post-processes emitted chunks
    NativeStreaming,
    /// The backend exposes tokenize/logits/decode primitives; the engine
    /// runs its own sampling loop
    BatchComplete,
}

/// Errors surfaced by a backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("decoding failed: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Outcome of a native streaming completion, before engine post-processing
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Full raw text produced by the backend
    pub text: String,
    /// Number of tokens the backend emitted
    pub token_count: usize,
    /// Whether the backend hit its end-of-sequence marker
    pub reached_eos: bool,
}

/// A loaded model ready to generate.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from a
/// blocking generation worker.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Decode capability, fixed for the lifetime of the handle
    fn capability(&self) -> BackendCapability;

    /// Context window in tokens
    fn context_window(&self) -> usize;

    /// End-of-sequence token id
    fn eos_token(&self) -> TokenId;

    /// Encode text into token ids
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    /// Decode token ids into text
    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError>;

    /// Unnormalized next-token distribution for the given context
    fn next_token_logits(&self, context: &[TokenId]) -> Result<Vec<f32>, BackendError>;

    /// Native streaming completion.
    ///
    /// `on_chunk` receives each newly decoded chunk and returns `false` to
    /// halt generation. Only meaningful for `NativeStreaming` models; the
    /// default rejects the call.
    async fn stream_complete(
        &self,
        _prompt: &str,
        _config: &SamplingConfig,
        _on_chunk: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<StreamOutcome, BackendError> {
        Err(BackendError::Unsupported("stream_complete"))
    }
}

/// Loader for a family of models.
///
/// The lifecycle manager holds exactly one backend and calls it under the
/// per-model op lock, so implementations need not serialize loads themselves.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Load the model described by `descriptor` into memory
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn TextModel>, BackendError>;
}
