//! Streaming generation engine
//!
//! Turns a loaded model and a request into a streamed token sequence.
//! Models with native streaming delegate to the backend primitive; others
//! go through the manual sampling loop. Either way the engine owns stop
//! conditions, post-processing, and degradation to a canned apology, so
//! `generate` never returns an error.

pub mod prompt;
mod sampling;

use crate::backend::{BackendCapability, BackendError, TextModel, TokenId};
use crate::types::SamplingConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Streaming callback; invoked from the generation worker's context with
/// each newly decoded piece of text.
///
/// Chunks never contain stop-string text. Final post-processing (trimming,
/// the short-output elaboration) applies to [`GenerationResult::text`] only,
/// so the concatenated chunks can differ from the final text at the edges.
pub type ChunkCallback = Box<dyn FnMut(&str) + Send>;

/// Canned reply used when generation fails internally
pub const APOLOGY: &str =
    "I'm sorry, something went wrong while generating this response. Please try again.";

/// Appended to answers shorter than the substantive minimum. Deliberate
/// behavior to avoid unhelpfully terse answers; see DESIGN.md.
const ELABORATION: &str =
    "Happy to expand on this if you tell me which part you would like more detail on.";

/// Outputs shorter than this many characters get the canned elaboration
const MIN_SUBSTANTIVE_CHARS: usize = 10;

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The model emitted its end-of-sequence marker
    Eos,
    /// A configured stop string appeared in the output
    StopSequence,
    /// The token budget was exhausted
    MaxTokens,
    /// Generation failed and degraded to the canned apology
    Error,
}

/// A single generation request. Created per call, never persisted.
pub struct GenerationRequest {
    /// Fully formatted prompt
    pub prompt: String,
    /// Sampling parameters
    pub config: SamplingConfig,
    /// Optional streaming callback
    pub on_chunk: Option<ChunkCallback>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, config: SamplingConfig) -> Self {
        Self {
            prompt: prompt.into(),
            config,
            on_chunk: None,
        }
    }

    /// Attach a streaming callback
    pub fn with_callback(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }
}

/// Outcome of one generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Post-processed text; never contains the prompt
    pub text: String,
    /// Tokens generated; never exceeds `max_new_tokens`
    pub token_count: usize,
    /// Wall time spent generating
    pub elapsed: Duration,
    /// What ended the generation
    pub stop_reason: StopReason,
}

/// Raw output before post-processing; the callback rides along so the
/// apology path can still terminate the caller's stream.
struct RawOutcome {
    text: String,
    token_count: usize,
    stop_reason: StopReason,
    callback: Option<ChunkCallback>,
    error: Option<String>,
}

/// The generation engine. Stateless; safe to share.
#[derive(Debug, Default)]
pub struct GenerationEngine;

impl GenerationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Generate a completion for `request` on `model`.
    ///
    /// Internal failures are converted into the canned apology with
    /// `StopReason::Error`; if a callback was in use, one final apology
    /// chunk is emitted so the stream always terminates cleanly.
    pub async fn generate(
        &self,
        model: Arc<dyn TextModel>,
        request: GenerationRequest,
    ) -> GenerationResult {
        let started = Instant::now();
        let mut config = request.config;
        config.validate();

        let mut outcome = match model.capability() {
            BackendCapability::NativeStreaming => {
                native_streaming(model, &request.prompt, &config, request.on_chunk).await
            }
            BackendCapability::BatchComplete => {
                let prompt = request.prompt;
                let callback = request.on_chunk;
                match tokio::task::spawn_blocking(move || {
                    manual_loop(model, &prompt, &config, callback)
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => RawOutcome {
                        text: String::new(),
                        token_count: 0,
                        stop_reason: StopReason::Error,
                        callback: None,
                        error: Some(format!("generation worker panicked: {e}")),
                    },
                }
            }
        };

        let elapsed = started.elapsed();

        if let Some(error) = outcome.error {
            tracing::error!("Generation failed: {}", error);
            if let Some(callback) = outcome.callback.as_mut() {
                callback(APOLOGY);
            }
            return GenerationResult {
                text: APOLOGY.to_string(),
                token_count: outcome.token_count,
                elapsed,
                stop_reason: StopReason::Error,
            };
        }

        let mut text = prompt::extract_assistant_reply(&outcome.text);
        if text.trim().len() < MIN_SUBSTANTIVE_CHARS {
            if text.is_empty() {
                text = ELABORATION.to_string();
            } else {
                text = format!("{text} {ELABORATION}");
            }
        }

        tracing::debug!(
            "Generated {} token(s) in {:?} ({:?})",
            outcome.token_count,
            elapsed,
            outcome.stop_reason
        );
        GenerationResult {
            text,
            token_count: outcome.token_count,
            elapsed,
            stop_reason: outcome.stop_reason,
        }
    }
}

/// Earliest position of any configured stop string in `text`
fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops.iter().filter_map(|s| text.find(s.as_str())).min()
}

/// Native path: the backend drives decoding, the engine scans for stops
async fn native_streaming(
    model: Arc<dyn TextModel>,
    prompt: &str,
    config: &SamplingConfig,
    callback: Option<ChunkCallback>,
) -> RawOutcome {
    let mut accumulated = String::new();
    let mut hit_stop = false;
    let mut cb = callback;
    let stops = config.stop.clone();

    let result = model
        .stream_complete(prompt, config, &mut |chunk| {
            let before = accumulated.len();
            accumulated.push_str(chunk);
            match find_stop(&accumulated, &stops) {
                Some(pos) => {
                    // Forward only the part of this chunk ahead of the stop
                    // match, so the stream never carries stop text
                    accumulated.truncate(pos);
                    hit_stop = true;
                    if let Some(cb) = cb.as_mut() {
                        if accumulated.len() > before {
                            cb(&accumulated[before..]);
                        }
                    }
                    false
                }
                None => {
                    if let Some(cb) = cb.as_mut() {
                        cb(chunk);
                    }
                    true
                }
            }
        })
        .await;

    match result {
        Ok(outcome) => {
            let stop_reason = if hit_stop {
                StopReason::StopSequence
            } else if outcome.reached_eos {
                StopReason::Eos
            } else {
                StopReason::MaxTokens
            };
            RawOutcome {
                text: accumulated,
                token_count: outcome.token_count,
                stop_reason,
                callback: cb,
                error: None,
            }
        }
        Err(e) => RawOutcome {
            text: accumulated,
            token_count: 0,
            stop_reason: StopReason::Error,
            callback: cb,
            error: Some(e.to_string()),
        },
    }
}

/// Manual sampling loop for batch-complete backends.
///
/// Runs on a blocking worker; the callback is invoked from that context.
fn manual_loop(
    model: Arc<dyn TextModel>,
    prompt: &str,
    config: &SamplingConfig,
    mut callback: Option<ChunkCallback>,
) -> RawOutcome {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let fail = |emitted: String, count: usize, callback, e: BackendError| RawOutcome {
        text: emitted,
        token_count: count,
        stop_reason: StopReason::Error,
        callback,
        error: Some(e.to_string()),
    };

    let prompt_tokens = match model.tokenize(prompt) {
        Ok(tokens) => tokens,
        Err(e) => return fail(String::new(), 0, callback, e),
    };

    // Keep the most recent turns when the prompt overflows the window
    let window = model.context_window();
    let budget = window.saturating_sub(config.max_new_tokens).max(1);
    let mut context: Vec<TokenId> = if prompt_tokens.len() > budget {
        tracing::debug!(
            "Prompt of {} token(s) truncated to suffix of {}",
            prompt_tokens.len(),
            budget
        );
        prompt_tokens[prompt_tokens.len() - budget..].to_vec()
    } else {
        prompt_tokens
    };

    let eos = model.eos_token();
    let mut generated: Vec<TokenId> = Vec::new();
    let mut emitted = String::new();
    let mut stop_reason = StopReason::MaxTokens;

    for _ in 0..config.max_new_tokens {
        let logits = match model.next_token_logits(&context) {
            Ok(logits) => logits,
            Err(e) => return fail(emitted, generated.len(), callback, e),
        };

        let mut probs = sampling::softmax_with_temperature(&logits, config.temperature);
        sampling::nucleus_filter(&mut probs, config.top_p);
        sampling::apply_repetition_penalty(&mut probs, &generated, config.repetition_penalty);
        sampling::ban_repeat_ngrams(&mut probs, &generated, config.no_repeat_ngram_size);

        let token = sampling::sample(&probs, &mut rng);
        if token == eos {
            stop_reason = StopReason::Eos;
            break;
        }

        generated.push(token);
        context.push(token);
        if context.len() > window {
            let excess = context.len() - window;
            context.drain(..excess);
        }

        // Incremental decode: only generated tokens, so the prompt can
        // never leak into the output
        let decoded = match model.decode(&generated) {
            Ok(decoded) => decoded,
            Err(e) => return fail(emitted, generated.len(), callback, e),
        };
        match decoded.strip_prefix(emitted.as_str()) {
            Some(new_text) if !new_text.is_empty() => {
                if let Some(cb) = callback.as_mut() {
                    cb(new_text);
                }
                emitted = decoded;
            }
            Some(_) => {}
            None => {
                // Decoder revised earlier text; resync without emitting
                emitted = decoded;
            }
        }

        if let Some(pos) = find_stop(&emitted, &config.stop) {
            emitted.truncate(pos);
            stop_reason = StopReason::StopSequence;
            break;
        }
    }

    RawOutcome {
        text: emitted,
        token_count: generated.len(),
        stop_reason,
        callback,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockModel;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn config() -> SamplingConfig {
        SamplingConfig {
            temperature: 0.7,
            top_p: 0.5,
            max_new_tokens: 64,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            stop: Vec::new(),
            seed: Some(11),
        }
    }

    fn engine() -> GenerationEngine {
        GenerationEngine::new()
    }

    #[tokio::test]
    async fn test_scripted_generation_runs_to_eos() {
        let model = Arc::new(MockModel::scripted(&["hello", "world", "from", "here"]));
        let result = engine()
            .generate(model, GenerationRequest::new("prompt", config()))
            .await;
        assert_eq!(result.text, "hello world from here");
        assert_eq!(result.token_count, 4);
        assert_eq!(result.stop_reason, StopReason::Eos);
    }

    #[tokio::test]
    async fn test_max_tokens_is_a_hard_cap() {
        let words: Vec<&str> = (0..40).map(|_| "again").collect();
        let model = Arc::new(MockModel::scripted(&words));
        let mut cfg = config();
        cfg.max_new_tokens = 10;
        let result = engine()
            .generate(model, GenerationRequest::new("prompt", cfg))
            .await;
        assert!(result.token_count <= 10);
        assert_eq!(result.stop_reason, StopReason::MaxTokens);
    }

    #[tokio::test]
    async fn test_stop_sequence_halts_and_truncates() {
        let model = Arc::new(MockModel::scripted(&[
            "first", "part", "STOP", "never", "emitted",
        ]));
        let mut cfg = config();
        cfg.stop = vec!["STOP".to_string()];
        let result = engine()
            .generate(model, GenerationRequest::new("prompt", cfg))
            .await;
        assert_eq!(result.stop_reason, StopReason::StopSequence);
        assert!(!result.text.contains("STOP"));
        assert!(!result.text.contains("never"));
        assert!(result.token_count <= 3);
    }

    #[tokio::test]
    async fn test_callback_receives_all_emitted_text() {
        let model = Arc::new(MockModel::scripted(&["streamed", "text", "arrives", "whole"]));
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let request = GenerationRequest::new("prompt", config())
            .with_callback(Box::new(move |chunk| sink.lock().unwrap().push_str(chunk)));
        let result = engine().generate(model, request).await;
        assert_eq!(*seen.lock().unwrap(), result.text);
    }

    #[tokio::test]
    async fn test_prompt_never_leaks_into_output() {
        let model = Arc::new(MockModel::scripted(&["completely", "fresh", "words"]));
        let result = engine()
            .generate(
                model,
                GenerationRequest::new("secret prompt material", config()),
            )
            .await;
        assert!(!result.text.contains("secret"));
        assert!(!result.text.contains("prompt"));
    }

    #[tokio::test]
    async fn test_long_prompt_is_suffix_truncated() {
        let model = Arc::new(MockModel::scripted(&["short", "reply", "comes", "back"]).with_context_window(32));
        let long_prompt = "word ".repeat(500);
        let mut cfg = config();
        cfg.max_new_tokens = 8;
        let result = engine()
            .generate(model, GenerationRequest::new(long_prompt, cfg))
            .await;
        assert_eq!(result.stop_reason, StopReason::Eos);
        assert_eq!(result.text, "short reply comes back");
    }

    #[tokio::test]
    async fn test_short_output_gets_elaboration() {
        let model = Arc::new(MockModel::scripted(&["ok"]));
        let result = engine()
            .generate(model, GenerationRequest::new("prompt", config()))
            .await;
        assert!(result.text.starts_with("ok"));
        assert!(result.text.len() >= MIN_SUBSTANTIVE_CHARS);
        assert!(result.text.contains("expand"));
    }

    struct FailingModel;

    #[async_trait]
    impl TextModel for FailingModel {
        fn capability(&self) -> BackendCapability {
            BackendCapability::BatchComplete
        }
        fn context_window(&self) -> usize {
            2048
        }
        fn eos_token(&self) -> TokenId {
            0
        }
        fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
            Ok(text.split_whitespace().map(|_| 1).collect())
        }
        fn decode(&self, _tokens: &[TokenId]) -> Result<String, BackendError> {
            Ok(String::new())
        }
        fn next_token_logits(&self, _context: &[TokenId]) -> Result<Vec<f32>, BackendError> {
            Err(BackendError::Inference("device lost".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failure_degrades_to_apology() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let request = GenerationRequest::new("prompt", config())
            .with_callback(Box::new(move |chunk| sink.lock().unwrap().push_str(chunk)));
        let result = engine().generate(Arc::new(FailingModel), request).await;
        assert_eq!(result.stop_reason, StopReason::Error);
        assert_eq!(result.text, APOLOGY);
        // The stream was terminated with a final apology chunk
        assert!(seen.lock().unwrap().contains(APOLOGY));
    }

    #[tokio::test]
    async fn test_native_streaming_path() {
        let model = Arc::new(MockModel::streaming(&["native", "chunks", "flow", "nicely"]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let request = GenerationRequest::new("prompt", config()).with_callback(Box::new(
            move |chunk| sink.lock().unwrap().push(chunk.to_string()),
        ));
        let result = engine().generate(model, request).await;
        assert_eq!(result.text, "native chunks flow nicely");
        assert_eq!(result.stop_reason, StopReason::Eos);
        assert_eq!(result.token_count, 4);
        assert!(seen.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_native_stop_sequence() {
        let model = Arc::new(MockModel::streaming(&["keep", "this", "HALT", "drop"]));
        let mut cfg = config();
        cfg.stop = vec!["HALT".to_string()];
        let result = engine()
            .generate(model, GenerationRequest::new("prompt", cfg))
            .await;
        assert_eq!(result.stop_reason, StopReason::StopSequence);
        assert!(!result.text.contains("HALT"));
        assert!(!result.text.contains("drop"));
    }

    #[tokio::test]
    async fn test_native_callback_never_sees_stop_text() {
        let model = Arc::new(MockModel::streaming(&["keep", "this", "HALT", "drop"]));
        let mut cfg = config();
        cfg.stop = vec!["HALT".to_string()];
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let request = GenerationRequest::new("prompt", cfg)
            .with_callback(Box::new(move |chunk| sink.lock().unwrap().push_str(chunk)));
        let result = engine().generate(model, request).await;
        assert_eq!(result.stop_reason, StopReason::StopSequence);
        let streamed = seen.lock().unwrap().clone();
        assert!(!streamed.contains("HALT"));
        assert_eq!(streamed.trim_end(), "keep this");
    }
}
