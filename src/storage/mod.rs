//! Persistence and external collaborators
//!
//! Conversation storage and response post-processing are consumed through
//! narrow traits; file-backed defaults are provided for local use.

use crate::orchestrator::Conversation;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("could not determine data directory")]
    DataDir,
}

/// Platform data directory for this application
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("", "", "emberlm")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::DataDir)
}

/// Conversation persistence contract.
///
/// `save_conversation` reports success as a boolean; persistence failures
/// must not abort a generation flow.
#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Persist a conversation; returns false on failure
    async fn save_conversation(&self, conversation: &Conversation) -> bool;

    /// Load a conversation by id, or None if absent/corrupt
    async fn load_conversation(&self, id: Uuid) -> Option<Conversation>;
}

/// One conversation per pretty-printed JSON file under a directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store conversations under `dir`, creating it lazily on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store conversations under the platform data directory
    pub fn in_data_dir() -> Result<Self, StorageError> {
        Ok(Self::new(get_data_dir()?.join("conversations")))
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn save_internal(&self, conversation: &Conversation) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(conversation)?;
        fs::write(self.path_for(conversation.id), json)?;
        Ok(())
    }
}

#[async_trait]
impl StorageManager for FileStorage {
    async fn save_conversation(&self, conversation: &Conversation) -> bool {
        match self.save_internal(conversation) {
            Ok(()) => {
                tracing::debug!("Saved conversation {}", conversation.id);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to save conversation {}: {}", conversation.id, e);
                false
            }
        }
    }

    async fn load_conversation(&self, id: Uuid) -> Option<Conversation> {
        let path = self.path_for(id);
        if !path.exists() {
            return None;
        }
        let json = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                tracing::warn!("Corrupt conversation file {:?}: {}", path, e);
                None
            }
        }
    }
}

/// A fenced code block extracted from generated text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Language tag after the opening fence, if any
    pub language: Option<String>,
    /// Block contents without the fences
    pub code: String,
}

/// Structured result of response post-processing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeBlocks {
    pub blocks: Vec<CodeBlock>,
}

/// Response post-processing contract, invoked after each generation
pub trait CodeBlockProcessor: Send + Sync {
    fn process_response(&self, text: &str) -> CodeBlocks;
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)\n(.*?)```").expect("fence regex"));

/// Extracts triple-backtick fenced blocks
#[derive(Debug, Default)]
pub struct FencedBlockProcessor;

impl CodeBlockProcessor for FencedBlockProcessor {
    fn process_response(&self, text: &str) -> CodeBlocks {
        let blocks = FENCE_RE
            .captures_iter(text)
            .map(|cap| {
                let lang = cap.get(1).map(|m| m.as_str()).unwrap_or("");
                CodeBlock {
                    language: if lang.is_empty() {
                        None
                    } else {
                        Some(lang.to_string())
                    },
                    code: cap[2].trim_end_matches('\n').to_string(),
                }
            })
            .collect();
        CodeBlocks { blocks }
    }
}
