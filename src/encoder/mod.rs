// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT masked language model.
//!
//! [`BertMaskedLm`] implements the `BertForMaskedLM` forward pass on
//! candle: embeddings, a stack of encoder layers, and the MLM prediction
//! head whose decoder is tied to the word embeddings.  An optional
//! [`AttentionObserver`] is threaded through the layer loop so each
//! layer's attention probabilities can be captured as the pass runs.

pub(crate) mod attention;
pub(crate) mod embeddings;
pub(crate) mod feed_forward;

use candle_core::{DType, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::capture::AttentionObserver;
use crate::config::BertConfig;
use crate::error::Result;

use self::attention::AttentionBlock;
use self::embeddings::BertEmbeddings;
use self::feed_forward::{apply_activation, FeedForward};

// ---------------------------------------------------------------------------
// EncoderLayer
// ---------------------------------------------------------------------------

/// One encoder layer: attention block followed by feed-forward block.
struct EncoderLayer {
    /// Self-attention with output projection and residual norm.
    attention: AttentionBlock,
    /// Feed-forward with residual norm.
    feed_forward: FeedForward,
}

impl EncoderLayer {
    /// Load one layer from a [`VarBuilder`] rooted at
    /// `bert.encoder.layer.{i}`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            attention: AttentionBlock::load(config, vb.pp("attention"))?,
            feed_forward: FeedForward::load(config, vb)?,
        })
    }
}

// ---------------------------------------------------------------------------
// MlmHead
// ---------------------------------------------------------------------------

/// The masked-LM prediction head (`cls.predictions`).
///
/// Transform dense + activation + layer norm, then a decoder tied to the
/// word embedding matrix plus a separate output bias.
struct MlmHead {
    /// Transform projection (`cls.predictions.transform.dense`).
    dense: Linear,
    /// Transform layer norm (`cls.predictions.transform.LayerNorm`).
    norm: LayerNorm,
    /// Decoder output bias (`cls.predictions.bias`), `[vocab_size]`.
    bias: Tensor,
}

impl MlmHead {
    /// Load the head from a [`VarBuilder`] rooted at `cls.predictions`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let vb_transform = vb.pp("transform");
        let dense = candle_nn::linear(
            config.hidden_size,
            config.hidden_size,
            vb_transform.pp("dense"),
        )?;
        let norm = candle_nn::layer_norm(
            config.hidden_size,
            candle_nn::LayerNormConfig {
                eps: config.layer_norm_eps,
                ..Default::default()
            },
            vb_transform.pp("LayerNorm"),
        )?;
        let bias = vb.get(config.vocab_size, "bias")?;
        Ok(Self { dense, norm, bias })
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - `embed_weight`: `[vocab_size, hidden_size]` -- tied decoder weight
    /// - returns: `[batch, seq, vocab_size]`
    fn forward(
        &self,
        hidden: &Tensor,
        embed_weight: &Tensor,
        activation: crate::config::Activation,
    ) -> Result<Tensor> {
        let transformed = apply_activation(&self.dense.forward(hidden)?, activation)?;
        let transformed = self.norm.forward(&transformed)?;

        // Tied decoder: logits = hidden @ embed_weight^T + bias.
        let logits = transformed.broadcast_matmul(&embed_weight.t()?)?;
        Ok(logits.broadcast_add(&self.bias)?)
    }
}

// ---------------------------------------------------------------------------
// BertMaskedLm
// ---------------------------------------------------------------------------

/// A BERT masked language model with observer-aware forward passes.
pub struct BertMaskedLm {
    /// Input embedding block.
    embeddings: BertEmbeddings,
    /// Encoder layers.
    layers: Vec<EncoderLayer>,
    /// MLM prediction head.
    mlm_head: MlmHead,
    /// Model configuration.
    config: BertConfig,
}

impl BertMaskedLm {
    /// Load a BERT masked LM from a [`VarBuilder`] over an HF-layout
    /// safetensors checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) if weight
    /// loading fails or dimensions are inconsistent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let vb_bert = vb.pp("bert");

        let embeddings = BertEmbeddings::load(&config, vb_bert.pp("embeddings"))?;

        let vb_layers = vb_bert.pp("encoder").pp("layer");
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(EncoderLayer::load(&config, vb_layers.pp(i.to_string()))?);
        }

        let mlm_head = MlmHead::load(&config, vb.pp("cls").pp("predictions"))?;

        Ok(Self {
            embeddings,
            layers,
            mlm_head,
            config,
        })
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &BertConfig {
        &self.config
    }

    /// Number of encoder layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    /// Number of attention heads per layer.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Run the forward pass, producing per-position vocabulary logits.
    ///
    /// When an observer is supplied it is invoked once per layer,
    /// synchronously, inside the layer loop; by the time this function
    /// returns the observer has seen all `num_layers` layers.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token ids
    /// - returns: `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) on tensor
    /// operation failures, or the observer's error if observation fails.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        mut observer: Option<&mut dyn AttentionObserver>,
    ) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;

        let mut hidden = self.embeddings.forward(input_ids)?;

        // Single unpadded sentence: the additive mask is all zeros, kept
        // explicit so the score math reads softmax(Q·Kᵀ/√d + mask).
        let mask = Tensor::zeros(
            (1, 1, seq_len, seq_len),
            DType::F32,
            input_ids.device(),
        )?
        .to_dtype(hidden.dtype())?;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            hidden = layer
                .attention
                .forward(
                    &hidden,
                    &mask,
                    layer_idx,
                    match observer {
                        Some(ref mut o) => Some(&mut **o),
                        None => None,
                    },
                )?;
            hidden = layer.feed_forward.forward(&hidden)?;
        }

        self.mlm_head.forward(
            &hidden,
            self.embeddings.word_embedding_matrix(),
            self.config.activation,
        )
    }
}
