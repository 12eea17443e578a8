// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model artifact acquisition via the `HuggingFace` hub.
//!
//! [`fetch_model`] resolves the three files a BERT masked-LM needs —
//! `config.json`, `tokenizer.json`, `model.safetensors` — from the local
//! `HuggingFace` cache (`~/.cache/huggingface/hub/`), downloading them
//! first when absent.  Progress and cache hits are reported via
//! `tracing` at `info` level.

use std::path::PathBuf;

use hf_hub::api::sync::Api;

use crate::error::{ClozeError, Result};

/// Resolved local paths for one model repository.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to `config.json`.
    pub config: PathBuf,
    /// Path to `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// Path to `model.safetensors`.
    pub weights: PathBuf,
}

/// Resolve (downloading if necessary) the model files for `model_id`.
///
/// # Errors
///
/// Returns [`ClozeError::Resource`] if any file cannot be located or
/// downloaded (network failure, authentication, repository not found).
pub fn fetch_model(model_id: &str) -> Result<ModelFiles> {
    let api = Api::new()
        .map_err(|e| ClozeError::Resource(format!("hub api init failed: {e}")))?;
    let repo = api.model(model_id.to_owned());

    tracing::info!(model_id, "resolving model files");

    let get = |filename: &str| {
        repo.get(filename).map_err(|e| {
            ClozeError::Resource(format!("failed to fetch {model_id}/{filename}: {e}"))
        })
    };

    let files = ModelFiles {
        config: get("config.json")?,
        tokenizer: get("tokenizer.json")?,
        weights: get("model.safetensors")?,
    };

    tracing::info!(
        model_id,
        weights = %files.weights.display(),
        "model files resolved",
    );
    Ok(files)
}
