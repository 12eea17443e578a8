// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cloze module: orchestration and the caller-facing capability trait.
//!
//! [`ClozeBackend`] is the interface inspection tools consume; adding a
//! new model family means implementing it as a separate variant, selected
//! by configuration.  [`BertCloze`] is the BERT-family implementation.
//!
//! Lifecycle: `Unloaded → Loaded → (Ready after ≥1 forward call)`.
//! `load()` acquires the model and tokenizer; `forward()` runs one
//! sentence and captures attention; queries read the most recent pass.
//! `unload()` drops everything.  A failed forward never replaces the
//! previous pass, so queries keep seeing consistent data.

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::capture::{AttentionBuffer, BufferObserver};
use crate::config::BertConfig;
use crate::download;
use crate::encoder::BertMaskedLm;
use crate::error::{ClozeError, Result};
use crate::mixer::{self, HeadMixMode, LayerMixMode};
use crate::sentence::TokenSentence;
use crate::tokenizer::ClozeTokenizer;

/// Blank marker in input sentences.
pub const BLANK_MARKER: char = '_';

// ---------------------------------------------------------------------------
// ClozeBackend trait
// ---------------------------------------------------------------------------

/// Capability interface for cloze modules.
///
/// One instance serves one language/model; instances are independent and
/// may be used concurrently by different callers.  Per instance the
/// execution model is single-threaded and synchronous: a `forward` call
/// runs to completion (including attention capture) before its results
/// are queryable, and queries must finish before the next `forward`.
pub trait ClozeBackend {
    /// Acquire the model and tokenizer.
    ///
    /// # Errors
    ///
    /// [`ClozeError::Resource`] if artifacts cannot be located or loaded;
    /// [`ClozeError::State`] if already loaded.
    fn load(&mut self) -> Result<()>;

    /// Release the model, tokenizer, and any pass state.
    fn unload(&mut self);

    /// Run one sentence through the model.
    ///
    /// Blanks are the literal [`BLANK_MARKER`] character.  Each blank is
    /// replaced by the model's single most probable token, left to right.
    ///
    /// # Errors
    ///
    /// [`ClozeError::State`] before `load()`; tokenizer and model errors
    /// propagate.  On error the previous pass, if any, is untouched.
    fn forward(&mut self, sentence: &str) -> Result<()>;

    /// Token sequence of the most recent input.
    ///
    /// # Errors
    ///
    /// [`ClozeError::State`] before any successful `forward`.
    fn input(&self) -> Result<&[String]>;

    /// Token sequence after mask substitution.
    ///
    /// # Errors
    ///
    /// [`ClozeError::State`] before any successful `forward`.
    fn output(&self) -> Result<&[String]>;

    /// Scalar attention weight between two tokens of the current
    /// sentence, under the given mix modes (parsed from strings).
    ///
    /// # Errors
    ///
    /// [`ClozeError::State`] before any forward; [`ClozeError::Mode`]
    /// for unknown modes (or `head_mode = "all"`, which has no scalar
    /// reduction); [`ClozeError::Token`] for token text not in the
    /// current sentence.
    fn attention_weights(
        &self,
        key: &str,
        query: &str,
        layer_mode: &str,
        head_mode: &str,
    ) -> Result<f32>;

    /// Per-head attention weights between two tokens, one value per
    /// attention head, under the given layer mode.
    ///
    /// # Errors
    ///
    /// As [`attention_weights`](Self::attention_weights), minus the head
    /// mode concerns.
    fn attention_weights_per_head(
        &self,
        key: &str,
        query: &str,
        layer_mode: &str,
    ) -> Result<Vec<f32>>;

    /// Supported layer mix modes, in presentation order.
    fn layer_mix_modes(&self) -> Vec<String> {
        LayerMixMode::ALL.iter().map(ToString::to_string).collect()
    }

    /// Supported head mix modes, in presentation order.
    fn head_mix_modes(&self) -> Vec<String> {
        HeadMixMode::ALL.iter().map(ToString::to_string).collect()
    }

    /// Human-readable module name.
    fn name(&self) -> String;

    /// HTML description for inspection front-ends.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// BertCloze
// ---------------------------------------------------------------------------

/// Results of one forward pass, committed atomically.
struct ForwardPass {
    /// Tokenized input sentence (with mask tokens).
    input: TokenSentence,
    /// Token sequence of the substituted sentence.
    output: Vec<String>,
    /// Captured attention stacked once at commit time,
    /// `[layers, heads, seq, seq]`.  Queries index this tensor directly.
    attention: Tensor,
}

/// Model, tokenizer, and pass state present only between `load()` and
/// `unload()`.
struct LoadedBert {
    /// The masked LM.
    model: BertMaskedLm,
    /// Tokenizer with resolved mask token.
    tokenizer: ClozeTokenizer,
    /// Most recent successful forward pass, if any.
    pass: Option<ForwardPass>,
}

/// BERT-family cloze module.
///
/// # Example
///
/// ```no_run
/// use candle_cloze::{BertCloze, ClozeBackend};
///
/// # fn main() -> candle_cloze::Result<()> {
/// let mut module = BertCloze::english();
/// module.load()?;
/// module.forward("The cat sat on the _.")?;
/// let weight = module.attention_weights("cat", "sat", "final", "average")?;
/// assert!((0.0..=1.0).contains(&weight));
/// # Ok(())
/// # }
/// ```
pub struct BertCloze {
    /// Display language (capitalized into the module name).
    language: String,
    /// `HuggingFace` model repository id.
    model_id: String,
    /// Device the model runs on.
    device: Device,
    /// Present between `load()` and `unload()`.
    loaded: Option<LoadedBert>,
}

impl BertCloze {
    /// Module for English cloze (`bert-base-uncased`).
    #[must_use]
    pub fn english() -> Self {
        Self::new("english", "bert-base-uncased")
    }

    /// Module for Chinese cloze (`bert-base-chinese`).
    #[must_use]
    pub fn chinese() -> Self {
        Self::new("chinese", "bert-base-chinese")
    }

    /// Module for an arbitrary BERT-family checkpoint.
    #[must_use]
    pub fn new(language: &str, model_id: &str) -> Self {
        Self {
            language: language.to_lowercase(),
            model_id: model_id.to_owned(),
            device: Device::Cpu,
            loaded: None,
        }
    }

    /// The model repository id this module loads.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Select the best available device (CUDA GPU 0, or CPU fallback).
    fn select_device() -> Result<Device> {
        Ok(Device::cuda_if_available(0)?)
    }

    /// The loaded state, or a state error.
    fn loaded(&self) -> Result<&LoadedBert> {
        self.loaded
            .as_ref()
            .ok_or_else(|| ClozeError::State("call load() first".into()))
    }

    /// The most recent pass, or a state error.
    fn pass(&self) -> Result<&ForwardPass> {
        self.loaded()?
            .pass
            .as_ref()
            .ok_or_else(|| ClozeError::State("run forward() first".into()))
    }

    /// Resolve a (key, query) token pair to positions in the current
    /// sentence.
    fn resolve_pair(pass: &ForwardPass, key: &str, query: &str) -> Result<(usize, usize)> {
        let key_pos = pass.input.position_of(key).ok_or_else(|| {
            ClozeError::Token(format!("token `{key}` not in current sentence"))
        })?;
        let query_pos = pass.input.position_of(query).ok_or_else(|| {
            ClozeError::Token(format!("token `{query}` not in current sentence"))
        })?;
        Ok((key_pos, query_pos))
    }

    /// Greedy-decode the most probable token id at one position.
    ///
    /// # Shapes
    /// - `logits`: `[1, seq, vocab_size]`
    fn argmax_at(logits: &Tensor, position: usize) -> Result<u32> {
        let row: Vec<f32> = logits
            .i((0, position))?
            .to_dtype(DType::F32)?
            .to_vec1()?;
        let (max_idx, _) = row
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| {
                ClozeError::Model(candle_core::Error::Msg("empty logits".into()))
            })?;
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        Ok(max_idx as u32)
    }
}

impl ClozeBackend for BertCloze {
    fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Err(ClozeError::State(
                "module already loaded; call unload() first".into(),
            ));
        }

        let device = Self::select_device()?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        tracing::info!(model_id = %self.model_id, "loading cloze module");

        let files = download::fetch_model(&self.model_id)?;

        let config_str = std::fs::read_to_string(&files.config)
            .map_err(|e| ClozeError::Resource(format!("read config.json: {e}")))?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| ClozeError::Config(format!("parse config.json: {e}")))?;
        let config = BertConfig::from_hf_config(&json)?;

        let data = std::fs::read(&files.weights).map_err(|e| {
            ClozeError::Resource(format!("read {}: {e}", files.weights.display()))
        })?;
        let vb = candle_nn::VarBuilder::from_buffered_safetensors(data, dtype, &device)?;

        let model = BertMaskedLm::load(config, vb)?;
        let tokenizer = ClozeTokenizer::from_file(&files.tokenizer)?;

        tracing::info!(
            model_id = %self.model_id,
            num_layers = model.num_layers(),
            num_heads = model.num_heads(),
            "cloze module loaded",
        );

        self.device = device;
        self.loaded = Some(LoadedBert {
            model,
            tokenizer,
            pass: None,
        });
        Ok(())
    }

    fn unload(&mut self) {
        self.loaded = None;
    }

    fn forward(&mut self, sentence: &str) -> Result<()> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| ClozeError::State("call load() first".into()))?;
        let model = &loaded.model;
        let tokenizer = &loaded.tokenizer;

        // Blanks become mask tokens before tokenization.
        let masked_text =
            sentence.replace(BLANK_MARKER, tokenizer.mask_token());
        let (tokens, ids) = tokenizer.encode(&masked_text)?;
        let input = TokenSentence::new(tokens, ids, tokenizer.mask_token_id());

        let seq_len = input.len();
        let mut buffer =
            AttentionBuffer::new(model.num_layers(), model.num_heads(), seq_len);

        let input_ids = Tensor::new(input.ids(), &self.device)?.unsqueeze(0)?;
        let logits = {
            let mut observer = BufferObserver::new(&mut buffer);
            model.forward(&input_ids, Some(&mut observer))?
        };

        let attention = buffer.stacked()?;

        // Decode each blank left to right using the original mask
        // positions; substitutions edit the raw sentence text.
        let output = if input.mask_positions().is_empty() {
            input.tokens().to_vec()
        } else {
            let mut predictions = Vec::with_capacity(input.mask_positions().len());
            for &position in input.mask_positions() {
                let token_id = Self::argmax_at(&logits, position)?;
                predictions.push(tokenizer.id_to_token(token_id)?);
            }
            let substituted =
                substitute_blanks(sentence, predictions.iter().map(String::as_str));
            tokenizer.encode(&substituted)?.0
        };

        tracing::debug!(
            seq_len,
            masks = input.mask_positions().len(),
            "forward pass complete",
        );

        // Commit atomically: only a fully successful pass replaces the
        // previous one.
        if let Some(loaded) = self.loaded.as_mut() {
            loaded.pass = Some(ForwardPass {
                input,
                output,
                attention,
            });
        }
        Ok(())
    }

    fn input(&self) -> Result<&[String]> {
        Ok(self.pass()?.input.tokens())
    }

    fn output(&self) -> Result<&[String]> {
        Ok(&self.pass()?.output)
    }

    fn attention_weights(
        &self,
        key: &str,
        query: &str,
        layer_mode: &str,
        head_mode: &str,
    ) -> Result<f32> {
        let layer_mode: LayerMixMode = layer_mode.parse()?;
        let head_mode: HeadMixMode = head_mode.parse()?;
        let pass = self.pass()?;
        let (key_pos, query_pos) = Self::resolve_pair(pass, key, query)?;
        mixer::weight(&pass.attention, key_pos, query_pos, layer_mode, head_mode)
    }

    fn attention_weights_per_head(
        &self,
        key: &str,
        query: &str,
        layer_mode: &str,
    ) -> Result<Vec<f32>> {
        let layer_mode: LayerMixMode = layer_mode.parse()?;
        let pass = self.pass()?;
        let (key_pos, query_pos) = Self::resolve_pair(pass, key, query)?;
        mixer::weight_per_head(&pass.attention, key_pos, query_pos, layer_mode)
    }

    fn name(&self) -> String {
        format!("BERT {}", capitalize(&self.language))
    }

    fn description(&self) -> String {
        format!(
            "<h1><a href=''>{}</a></h1>\
             <p>This is a pretrained module to do cloze test in {}.</p>",
            self.name(),
            capitalize(&self.language)
        )
    }
}

/// Substitute predicted tokens into the raw sentence text, one blank at
/// a time, left to right.
fn substitute_blanks<'a, I>(sentence: &str, predictions: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut substituted = sentence.to_owned();
    for token in predictions {
        substituted = substituted.replacen(BLANK_MARKER, token, 1);
    }
    substituted
}

/// Uppercase the first character of a word.
fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn mode_lists_match_reference() {
        let module = BertCloze::english();
        assert_eq!(module.layer_mix_modes(), ["first", "final", "average"]);
        assert_eq!(module.head_mix_modes(), ["first", "average", "all"]);
    }

    #[test]
    fn name_and_description() {
        let module = BertCloze::english();
        assert_eq!(module.name(), "BERT English");
        assert!(module.description().contains("BERT English"));

        let module = BertCloze::chinese();
        assert_eq!(module.name(), "BERT Chinese");
        assert_eq!(module.model_id(), "bert-base-chinese");
    }

    #[test]
    fn queries_before_load_are_state_errors() {
        let module = BertCloze::english();
        assert!(matches!(module.input(), Err(ClozeError::State(_))));
        assert!(matches!(module.output(), Err(ClozeError::State(_))));
        assert!(matches!(
            module.attention_weights("a", "b", "first", "first"),
            Err(ClozeError::State(_))
        ));
        assert!(matches!(
            module.attention_weights_per_head("a", "b", "final"),
            Err(ClozeError::State(_))
        ));
    }

    #[test]
    fn forward_before_load_is_state_error() {
        let mut module = BertCloze::english();
        assert!(matches!(
            module.forward("The cat sat on the _."),
            Err(ClozeError::State(_))
        ));
    }

    #[test]
    fn unload_without_load_is_harmless() {
        let mut module = BertCloze::english();
        module.unload();
        assert!(matches!(
            module.forward("anything"),
            Err(ClozeError::State(_))
        ));
    }

    #[test]
    fn bad_mode_is_rejected_before_state_check() {
        // Mode validation happens on parse, so even an unloaded module
        // reports the offending mode by name.
        let module = BertCloze::english();
        let err = module
            .attention_weights("a", "b", "median", "first")
            .unwrap_err();
        assert!(matches!(err, ClozeError::Mode(_)));
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn blanks_fill_left_to_right() {
        let filled = substitute_blanks("_ is the _ of France.", ["Paris", "capital"]);
        assert_eq!(filled, "Paris is the capital of France.");
    }

    #[test]
    fn extra_predictions_leave_text_unchanged() {
        // One blank, two predictions: the second replacen finds nothing.
        let filled = substitute_blanks("The _ sat.", ["cat", "dog"]);
        assert_eq!(filled, "The cat sat.");
    }

    #[test]
    fn no_blanks_is_identity() {
        let filled = substitute_blanks("Nothing to fill.", []);
        assert_eq!(filled, "Nothing to fill.");
    }

    #[test]
    fn capitalize_words() {
        assert_eq!(capitalize("english"), "English");
        assert_eq!(capitalize(""), "");
    }
}
