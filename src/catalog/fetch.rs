//! Model artifact download
//!
//! Fetches GGUF artifacts from HuggingFace Hub into a models directory.
//! Downloads go to a temp file first and are renamed into place.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Errors from artifact fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid artifact reference: {0}")]
    InvalidReference(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("download incomplete: got {got} of {expected} bytes")]
    Incomplete { got: u64, expected: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reference to a downloadable artifact on HuggingFace Hub
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl ArtifactRef {
    /// Parse `https://huggingface.co/user/repo/{blob,resolve}/rev/file`,
    /// `user/repo/file`, or `user/repo`.
    pub fn parse(reference: &str) -> Result<Self, FetchError> {
        let reference = reference.trim();
        let reference = reference.split(['?', '#']).next().unwrap_or(reference);

        let path = reference
            .strip_prefix("https://huggingface.co/")
            .or_else(|| reference.strip_prefix("http://huggingface.co/"))
            .unwrap_or(reference);

        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(FetchError::InvalidReference(reference.to_string()));
        }
        let repo_id = format!("{}/{}", parts[0], parts[1]);

        // Full hub URL with an explicit revision segment
        if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
            if parts.len() > pos + 2 {
                return Ok(Self {
                    repo_id,
                    filename: parts[pos + 2..].join("/"),
                    revision: parts[pos + 1].to_string(),
                });
            }
        }

        Ok(Self {
            repo_id,
            filename: if parts.len() > 2 {
                parts[2..].join("/")
            } else {
                String::new()
            },
            revision: "main".to_string(),
        })
    }

    /// Direct download URL for this artifact
    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/resolve/{}/{}",
            self.repo_id, self.revision, self.filename
        )
    }
}

/// Flatten a repo-relative filename into a single safe filesystem name
fn sanitize_local_filename(filename: &str) -> Result<String, FetchError> {
    let flattened = filename
        .trim()
        .trim_start_matches('/')
        .replace('\\', "/")
        .replace('/', "__");

    let mut sanitized: String = flattened
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*') {
                '_'
            } else {
                ch
            }
        })
        .collect();

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(FetchError::InvalidReference(filename.to_string()));
    }
    Ok(sanitized)
}

/// Download an artifact into `models_dir`, reporting `(downloaded, total)`
/// through `progress`. Returns the final path. Skips the download when a
/// non-empty file with the same name is already present.
pub async fn download_artifact(
    reference: &str,
    models_dir: &Path,
    progress: impl Fn(u64, u64) + Send + 'static,
) -> Result<PathBuf, FetchError> {
    let artifact = ArtifactRef::parse(reference)?;
    if artifact.filename.is_empty() {
        return Err(FetchError::InvalidReference(
            "reference does not name a file".to_string(),
        ));
    }

    fs::create_dir_all(models_dir)?;
    let safe_name = sanitize_local_filename(&artifact.filename)?;
    let output_path = models_dir.join(&safe_name);
    let temp_path = models_dir.join(format!("{safe_name}.part"));

    if let Ok(meta) = fs::metadata(&output_path) {
        if meta.len() > 0 {
            tracing::info!("Artifact already present: {:?}", output_path);
            return Ok(output_path);
        }
    }

    let url = artifact.download_url();
    tracing::info!("Downloading {}", url);
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3600))
        .build()?;
    let mut response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }
    let total = response.content_length().unwrap_or(0);

    let mut file = File::create(&temp_path).await?;
    let mut downloaded: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        progress(downloaded, total);
    }
    file.flush().await?;
    drop(file);

    if total > 0 && downloaded != total {
        let _ = fs::remove_file(&temp_path);
        return Err(FetchError::Incomplete {
            got: downloaded,
            expected: total,
        });
    }

    fs::rename(&temp_path, &output_path)?;
    tracing::info!("Download complete: {:?}", output_path);
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let r = ArtifactRef::parse(
            "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/resolve/main/llama-2-7b.Q4_K_M.gguf",
        )
        .unwrap();
        assert_eq!(r.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(r.filename, "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(r.revision, "main");
    }

    #[test]
    fn test_parse_short_form() {
        let r = ArtifactRef::parse("TheBloke/Llama-2-7B-GGUF/llama-2-7b.Q4_K_M.gguf").unwrap();
        assert_eq!(r.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(r.filename, "llama-2-7b.Q4_K_M.gguf");
    }

    #[test]
    fn test_parse_repo_only() {
        let r = ArtifactRef::parse("TheBloke/Llama-2-7B-GGUF").unwrap();
        assert_eq!(r.filename, "");
        assert!(ArtifactRef::parse("justonepart").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(
            sanitize_local_filename("sub/dir/model.gguf").unwrap(),
            "sub__dir__model.gguf"
        );
        assert_eq!(sanitize_local_filename("a:b?.gguf").unwrap(), "a_b_.gguf");
        assert!(sanitize_local_filename("///").is_err());
    }
}
