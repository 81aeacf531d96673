use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Check that the configured weights file is present. Weights are never
/// downloaded: acquiring the file is the deployment's job.
pub fn resolve_model_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("Model file not found: {}", path.display());
    }
    if !path.is_file() {
        bail!("Model path is not a file: {}", path.display());
    }
    if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
        tracing::warn!(path = %path.display(), "Model file does not have a .gguf extension");
    }
    Ok(path.to_path_buf())
}

/// Locate `tokenizer.json`.
///
/// `source` may be a file, a directory containing `tokenizer.json`, or a
/// HuggingFace repo id. Without a source, the file next to the model is used.
pub fn resolve_tokenizer(source: Option<&str>, model_path: &Path) -> Result<PathBuf> {
    match source {
        Some(source) => {
            let path = PathBuf::from(source);
            if path.is_file() {
                return Ok(path);
            }
            if path.is_dir() {
                let candidate = path.join("tokenizer.json");
                if candidate.is_file() {
                    return Ok(candidate);
                }
                bail!("No tokenizer.json found in {}", path.display());
            }
            fetch_tokenizer(source)
        }
        None => {
            let candidate = model_path
                .parent()
                .map(|dir| dir.join("tokenizer.json"))
                .filter(|p| p.is_file());
            match candidate {
                Some(path) => Ok(path),
                None => bail!(
                    "No tokenizer.json next to {}; pass --tokenizer with a path or HuggingFace repo id",
                    model_path.display()
                ),
            }
        }
    }
}

/// Download (or reuse the cached) `tokenizer.json` of a HuggingFace repo.
fn fetch_tokenizer(repo_id: &str) -> Result<PathBuf> {
    tracing::info!(repo_id, "Fetching tokenizer from HuggingFace Hub");
    let api = hf_hub::api::sync::Api::new()?;
    let path = api.model(repo_id.to_string()).get("tokenizer.json")?;
    tracing::info!(path = %path.display(), "Tokenizer downloaded/cached");
    Ok(path)
}
