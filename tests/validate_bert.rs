// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: run real BERT checkpoints from the HuggingFace
//! cache through the cloze module and validate predictions and captured
//! attention.
//!
//! These tests require model weights in the local HF cache.
//!
//! Run:
//!   `cargo test --test validate_bert`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    clippy::float_cmp,
    missing_docs
)]

use candle_cloze::{BertCloze, BertConfig, ClozeBackend, HeadMixMode, LayerMixMode};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Find the HuggingFace cache directory.
fn hf_cache_dir() -> std::path::PathBuf {
    if let Ok(cache) = std::env::var("HF_HOME") {
        return std::path::PathBuf::from(cache).join("hub");
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return std::path::PathBuf::from(home)
            .join(".cache")
            .join("huggingface")
            .join("hub");
    }
    if let Ok(home) = std::env::var("HOME") {
        return std::path::PathBuf::from(home)
            .join(".cache")
            .join("huggingface")
            .join("hub");
    }
    panic!("Cannot find HuggingFace cache directory");
}

/// Find the snapshot directory for a given model ID.
fn find_snapshot(model_id: &str) -> Option<std::path::PathBuf> {
    let model_dir_name = format!("models--{}", model_id.replace('/', "--"));
    let snapshots_dir = hf_cache_dir().join(model_dir_name).join("snapshots");
    let entry = std::fs::read_dir(snapshots_dir).ok()?.next()?.ok()?;
    Some(entry.path())
}

/// Load the English module, or None if the weights are not cached.
fn loaded_english() -> Option<BertCloze> {
    find_snapshot("bert-base-uncased")?;
    let mut module = BertCloze::english();
    module.load().unwrap();
    Some(module)
}

// ===========================================================================
// bert-base-uncased
// ===========================================================================

#[test]
fn bert_base_uncased_config_parse() {
    let snapshot = match find_snapshot("bert-base-uncased") {
        Some(s) => s,
        None => {
            eprintln!("SKIP: bert-base-uncased not in cache");
            return;
        }
    };

    let config_str = std::fs::read_to_string(snapshot.join("config.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&config_str).unwrap();
    let config = BertConfig::from_hf_config(&json).unwrap();

    assert_eq!(config.hidden_size, 768);
    assert_eq!(config.num_layers, 12);
    assert_eq!(config.num_attention_heads, 12);
    assert_eq!(config.head_dim, 64);
    assert_eq!(config.intermediate_size, 3072);
    assert_eq!(config.vocab_size, 30522);
    assert_eq!(config.max_position_embeddings, 512);
}

#[test]
fn bert_base_uncased_cloze() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    let sentence = "The cat sat on the _.";
    module.forward(sentence).unwrap();

    let input = module.input().unwrap().to_vec();
    assert_eq!(input.first().map(String::as_str), Some("[CLS]"));
    assert_eq!(input.last().map(String::as_str), Some("[SEP]"));
    assert!(input.iter().any(|t| t == "[MASK]"));

    let output = module.output().unwrap().to_vec();
    println!("'{sentence}' -> {output:?}");
    assert!(!output.iter().any(|t| t == "[MASK]"));

    // The blank is a noun slot; the prediction should be a real word,
    // typically "mat" / "floor" / "bed" for this classic example.
    let filled = &output[input.iter().position(|t| t == "[MASK]").unwrap()];
    assert!(filled.chars().all(char::is_alphanumeric), "got '{filled}'");
}

#[test]
fn bert_base_uncased_two_blanks_fill_in_order() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    let sentence = "_ is the _ of France.";
    module.forward(sentence).unwrap();

    let input = module.input().unwrap().to_vec();
    assert_eq!(input.iter().filter(|t| *t == "[MASK]").count(), 2);

    // Both blanks get substituted; nothing is left unfilled.
    let output = module.output().unwrap().to_vec();
    println!("'{sentence}' -> {output:?}");
    assert!(!output.iter().any(|t| t == "[MASK]"));
    assert!(!output.iter().any(|t| t.contains('_')));
    assert!(output.iter().any(|t| t == "france"));
}

#[test]
fn bert_base_uncased_no_blank_echoes_input() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    module.forward("The quick brown fox jumped over lazy dogs").unwrap();
    assert_eq!(module.input().unwrap(), module.output().unwrap());
}

#[test]
fn bert_base_uncased_attention_rows_are_stochastic() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    // Distinct tokens throughout, so every position is addressable by
    // its token text.
    module.forward("a quick brown fox jumped over lazy dogs").unwrap();
    let tokens = module.input().unwrap().to_vec();

    // With layer and head fixed, each captured row distributes one unit
    // of attention over the sequence.
    for key in &tokens {
        let row_sum: f32 = tokens
            .iter()
            .map(|query| {
                module
                    .attention_weights(key, query, "first", "first")
                    .unwrap()
            })
            .sum();
        assert!(
            (row_sum - 1.0).abs() < 1e-3,
            "row for '{key}' sums to {row_sum}"
        );
    }
}

#[test]
fn bert_base_uncased_mix_modes_stay_in_unit_interval() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    module.forward("The cat sat on the _.").unwrap();

    for layer_mode in LayerMixMode::ALL {
        for head_mode in [HeadMixMode::First, HeadMixMode::Average] {
            let w = module
                .attention_weights(
                    "cat",
                    "sat",
                    &layer_mode.to_string(),
                    &head_mode.to_string(),
                )
                .unwrap();
            assert!(
                (0.0..=1.0).contains(&w),
                "cat->sat weight {w} out of range for {layer_mode}/{head_mode}"
            );
        }
    }
}

#[test]
fn bert_base_uncased_per_head_weights() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    module.forward("The cat sat on the _.").unwrap();

    let per_head = module
        .attention_weights_per_head("cat", "sat", "final")
        .unwrap();
    assert_eq!(per_head.len(), 12);
    assert!(per_head.iter().all(|w| (0.0..=1.0).contains(w)));

    // The scalar head-average must agree with the mean of the per-head
    // values.
    let scalar = module
        .attention_weights("cat", "sat", "final", "average")
        .unwrap();
    let mean = per_head.iter().sum::<f32>() / per_head.len() as f32;
    assert!((scalar - mean).abs() < 1e-5);
}

#[test]
fn bert_base_uncased_unknown_token_rejected() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    module.forward("The cat sat on the _.").unwrap();

    let err = module
        .attention_weights("zebra", "cat", "first", "first")
        .unwrap_err();
    assert!(err.to_string().contains("zebra"));
}

#[test]
fn bert_base_uncased_repeat_forward_replaces_pass() {
    let Some(mut module) = loaded_english() else {
        eprintln!("SKIP: bert-base-uncased not in cache");
        return;
    };

    module.forward("The cat sat on the _.").unwrap();

    module.forward("Paris is the capital of _.").unwrap();
    let input = module.input().unwrap();
    assert!(input.iter().any(|t| t == "paris"));

    // Queries address the new sentence only.
    assert!(module
        .attention_weights("cat", "sat", "first", "first")
        .is_err());
    assert!(module
        .attention_weights("paris", "capital", "final", "average")
        .is_ok());
}
