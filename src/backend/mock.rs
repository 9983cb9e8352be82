//! Scripted in-process backend
//!
//! A deterministic [`TextModel`] that replays a fixed word script. Used by
//! the crate's own tests and useful for wiring demos without model weights.

use super::{
    BackendCapability, BackendError, ModelBackend, StreamOutcome, TextModel, TokenId,
};
use crate::types::{ModelDescriptor, SamplingConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reserved id for the end-of-sequence marker
const EOS: TokenId = 0;

/// A model that emits a fixed sequence of words and then EOS.
///
/// `next_token_logits` puts almost all probability mass on the next scripted
/// word, so greedy or near-greedy sampling reproduces the script exactly
/// while still exercising the full sampling pipeline.
pub struct MockModel {
    vocab: Vec<String>,
    index: HashMap<String, TokenId>,
    script: Vec<TokenId>,
    step: AtomicUsize,
    capability: BackendCapability,
    context_window: usize,
}

impl MockModel {
    /// Build a batch-complete model that replays `words`
    pub fn scripted(words: &[&str]) -> Self {
        Self::with_capability(words, BackendCapability::BatchComplete)
    }

    /// Build a native-streaming model that replays `words`
    pub fn streaming(words: &[&str]) -> Self {
        Self::with_capability(words, BackendCapability::NativeStreaming)
    }

    fn with_capability(words: &[&str], capability: BackendCapability) -> Self {
        let mut vocab = vec!["<eos>".to_string()];
        let mut index = HashMap::new();
        let mut script = Vec::with_capacity(words.len());
        for word in words {
            let id = *index.entry(word.to_string()).or_insert_with(|| {
                vocab.push(word.to_string());
                (vocab.len() - 1) as TokenId
            });
            script.push(id);
        }
        Self {
            vocab,
            index,
            script,
            step: AtomicUsize::new(0),
            capability,
            context_window: 4096,
        }
    }

    /// Shrink the context window (for truncation tests)
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    fn scripted_words(&self) -> Vec<&str> {
        self.script
            .iter()
            .map(|&id| self.vocab[id as usize].as_str())
            .collect()
    }
}

#[async_trait]
impl TextModel for MockModel {
    fn capability(&self) -> BackendCapability {
        self.capability
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        // Words outside the script vocabulary hash to a stable non-EOS id so
        // prompt length is still proportional to word count.
        Ok(text
            .split_whitespace()
            .map(|word| match self.index.get(word) {
                Some(&id) => id,
                None => {
                    let h: usize = word.bytes().map(|b| b as usize).sum();
                    (1 + h % (self.vocab.len() - 1).max(1)) as TokenId
                }
            })
            .collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        let words: Vec<&str> = tokens
            .iter()
            .filter(|&&id| id != EOS)
            .map(|&id| {
                self.vocab
                    .get(id as usize)
                    .map(|s| s.as_str())
                    .unwrap_or("?")
            })
            .collect();
        Ok(words.join(" "))
    }

    fn next_token_logits(&self, _context: &[TokenId]) -> Result<Vec<f32>, BackendError> {
        let step = self.step.fetch_add(1, Ordering::SeqCst);
        let mut logits = vec![0.0f32; self.vocab.len()];
        match self.script.get(step) {
            Some(&id) => logits[id as usize] = 16.0,
            None => logits[EOS as usize] = 16.0,
        }
        Ok(logits)
    }

    async fn stream_complete(
        &self,
        _prompt: &str,
        config: &SamplingConfig,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<StreamOutcome, BackendError> {
        if self.capability != BackendCapability::NativeStreaming {
            return Err(BackendError::Unsupported("stream_complete"));
        }
        let mut text = String::new();
        let mut count = 0usize;
        let mut reached_eos = true;
        for word in self.scripted_words() {
            if count >= config.max_new_tokens {
                reached_eos = false;
                break;
            }
            let chunk = if text.is_empty() {
                word.to_string()
            } else {
                format!(" {word}")
            };
            text.push_str(&chunk);
            count += 1;
            if !on_chunk(&chunk) {
                reached_eos = false;
                break;
            }
        }
        Ok(StreamOutcome {
            text,
            token_count: count,
            reached_eos,
        })
    }
}

/// Backend that hands out [`MockModel`]s and records load activity.
///
/// Tests use the counters to assert that concurrent loads for the same id
/// collapse into a single real load.
pub struct MockBackend {
    script: Vec<String>,
    capability: BackendCapability,
    /// Ids for which load should fail
    pub fail_ids: std::sync::RwLock<Vec<String>>,
    /// Number of successful backend loads performed
    pub load_count: AtomicUsize,
    /// Artificial load latency
    pub load_delay: Duration,
}

impl MockBackend {
    /// Backend whose models replay `words`
    pub fn new(words: &[&str]) -> Self {
        Self {
            script: words.iter().map(|w| w.to_string()).collect(),
            capability: BackendCapability::BatchComplete,
            fail_ids: std::sync::RwLock::new(Vec::new()),
            load_count: AtomicUsize::new(0),
            load_delay: Duration::ZERO,
        }
    }

    /// Same script, native-streaming capability
    pub fn streaming(words: &[&str]) -> Self {
        Self {
            capability: BackendCapability::NativeStreaming,
            ..Self::new(words)
        }
    }

    /// Mark `id` so its next loads fail
    pub fn fail_loads_for(&self, id: &str) {
        self.fail_ids.write().unwrap().push(id.to_string());
    }

    /// Stop failing loads for `id`
    pub fn clear_failure(&self, id: &str) {
        self.fail_ids.write().unwrap().retain(|i| i != id);
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn TextModel>, BackendError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_ids.read().unwrap().iter().any(|i| i == &descriptor.id) {
            return Err(BackendError::Load(format!(
                "mock backend configured to fail for {}",
                descriptor.id
            )));
        }
        self.load_count.fetch_add(1, Ordering::SeqCst);
        let words: Vec<&str> = self.script.iter().map(|s| s.as_str()).collect();
        let model = MockModel::with_capability(&words, self.capability)
            .with_context_window(descriptor.hints.context_window);
        Ok(Arc::new(model))
    }
}
