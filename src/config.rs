// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT configuration and `HuggingFace` `config.json` parsing.
//!
//! [`BertConfig`] captures the dimensions and architectural knobs of the
//! BERT encoder family (`bert-base-uncased`, `bert-base-chinese`,
//! multilingual variants, ...).  Parsed from a `HuggingFace` `config.json`
//! via [`from_hf_config`](BertConfig::from_hf_config).
//!
//! # Usage
//!
//! ```
//! use candle_cloze::BertConfig;
//!
//! let config_str = r#"{"model_type": "bert", "hidden_size": 768,
//!     "num_hidden_layers": 12, "num_attention_heads": 12,
//!     "intermediate_size": 3072, "vocab_size": 30522,
//!     "max_position_embeddings": 512, "type_vocab_size": 2,
//!     "layer_norm_eps": 1e-12}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = BertConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 12);
//! assert_eq!(config.head_dim, 64);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{ClozeError, Result};

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Activation function used in the intermediate (feed-forward) layer and
/// the MLM head transform.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Gaussian Error Linear Unit — exact (erf) variant.  The BERT default.
    Gelu,
    /// Gaussian Error Linear Unit — tanh approximation (`gelu_new`).
    GeluApprox,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gelu => write!(f, "GELU"),
            Self::GeluApprox => write!(f, "GELU (tanh approx)"),
        }
    }
}

// ---------------------------------------------------------------------------
// BertConfig
// ---------------------------------------------------------------------------

/// Configuration for a BERT-family masked language model.
#[derive(Debug, Clone)]
pub struct BertConfig {
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of encoder layers.
    pub num_layers: usize,
    /// Number of attention heads per layer.
    pub num_attention_heads: usize,
    /// Dimension per head (`hidden_size / num_attention_heads`).
    pub head_dim: usize,
    /// Feed-forward intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length for learned position embeddings.
    pub max_position_embeddings: usize,
    /// Number of token type (segment) embeddings.
    pub type_vocab_size: usize,
    /// Epsilon for layer normalization.
    pub layer_norm_eps: f64,
    /// Feed-forward activation function.
    pub activation: Activation,
    /// Padding token id.
    pub pad_token_id: u32,
}

impl BertConfig {
    /// Parse a [`BertConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Config`] if `model_type` is missing or not a
    /// BERT variant, or if required dimension fields are absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ClozeError::Config("missing 'model_type' field".into()))?;

        if model_type != "bert" {
            return Err(ClozeError::Config(format!(
                "unsupported model_type: '{model_type}' (expected 'bert')"
            )));
        }

        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;
        if num_attention_heads == 0 {
            return Err(ClozeError::Config(
                "num_attention_heads is 0, cannot compute head_dim".into(),
            ));
        }
        if hidden_size % num_attention_heads != 0 {
            return Err(ClozeError::Config(format!(
                "hidden_size {hidden_size} is not divisible by \
                 num_attention_heads {num_attention_heads}"
            )));
        }

        let activation = match config.get("hidden_act").and_then(Value::as_str) {
            None | Some("gelu") => Activation::Gelu,
            Some("gelu_new" | "gelu_pytorch_tanh") => Activation::GeluApprox,
            Some(other) => {
                return Err(ClozeError::Config(format!(
                    "unsupported hidden_act: '{other}'"
                )));
            }
        };

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            head_dim: hidden_size / num_attention_heads,
            intermediate_size: get_usize(config, "intermediate_size")?,
            vocab_size: get_usize(config, "vocab_size")?,
            max_position_embeddings: get_usize_or(config, "max_position_embeddings", 512),
            type_vocab_size: get_usize_or(config, "type_vocab_size", 2),
            layer_norm_eps: get_f64_or(config, "layer_norm_eps", 1e-12),
            activation,
            pad_token_id: get_u32_or(config, "pad_token_id", 0),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ClozeError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| ClozeError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `u32` field, returning a default if absent.
fn get_u32_or(config: &Value, key: &str, default: u32) -> u32 {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Helper to create a bert-base-uncased style config JSON.
    fn bert_base_json() -> Value {
        serde_json::json!({
            "model_type": "bert",
            "hidden_size": 768,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "intermediate_size": 3072,
            "vocab_size": 30522,
            "max_position_embeddings": 512,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12,
            "hidden_act": "gelu",
            "pad_token_id": 0
        })
    }

    #[test]
    fn parse_bert_base() {
        let config = BertConfig::from_hf_config(&bert_base_json()).unwrap();
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_layers, 12);
        assert_eq!(config.num_attention_heads, 12);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.vocab_size, 30522);
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.type_vocab_size, 2);
        assert_eq!(config.activation, Activation::Gelu);
        assert_eq!(config.pad_token_id, 0);
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let json = serde_json::json!({
            "model_type": "bert",
            "hidden_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "intermediate_size": 512,
            "vocab_size": 1000
        });
        let config = BertConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.type_vocab_size, 2);
        assert!((config.layer_norm_eps - 1e-12).abs() < f64::EPSILON);
        assert_eq!(config.activation, Activation::Gelu);
    }

    #[test]
    fn non_bert_model_type_errors() {
        let json = serde_json::json!({ "model_type": "llama", "hidden_size": 2048 });
        assert!(BertConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn missing_model_type_errors() {
        let json = serde_json::json!({ "hidden_size": 768 });
        assert!(BertConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn indivisible_heads_errors() {
        let json = serde_json::json!({
            "model_type": "bert",
            "hidden_size": 100,
            "num_hidden_layers": 2,
            "num_attention_heads": 3,
            "intermediate_size": 512,
            "vocab_size": 1000
        });
        assert!(BertConfig::from_hf_config(&json).is_err());
    }
}
