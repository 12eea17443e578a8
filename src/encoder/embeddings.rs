// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT input embeddings: word + learned position + token type, followed
//! by layer normalization.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};

use crate::config::BertConfig;
use crate::error::Result;

/// The embedding block of a BERT encoder.
pub struct BertEmbeddings {
    /// Token embedding matrix `[vocab_size, hidden_size]`.
    word_embeddings: Embedding,
    /// Learned position embeddings `[max_position_embeddings, hidden_size]`.
    position_embeddings: Embedding,
    /// Segment embeddings `[type_vocab_size, hidden_size]`.
    token_type_embeddings: Embedding,
    /// Post-sum layer normalization.
    norm: LayerNorm,
}

impl BertEmbeddings {
    /// Load embedding weights from a [`VarBuilder`] rooted at
    /// `bert.embeddings`.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let word_embeddings = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("word_embeddings"),
        )?;
        let position_embeddings = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = candle_nn::embedding(
            config.type_vocab_size,
            config.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let norm = candle_nn::layer_norm(
            config.hidden_size,
            candle_nn::LayerNormConfig {
                eps: config.layer_norm_eps,
                ..Default::default()
            },
            vb.pp("LayerNorm"),
        )?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            norm,
        })
    }

    /// Embed a single-segment input sequence.
    ///
    /// Token type ids are all zero: the cloze task always presents one
    /// sentence, never a pair.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token ids
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let words = self.word_embeddings.forward(input_ids)?;

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let position_ids = Tensor::arange(0, seq_len as u32, device)?.unsqueeze(0)?;
        let positions = self.position_embeddings.forward(&position_ids)?;

        let token_type_ids = input_ids.zeros_like()?;
        let segments = self.token_type_embeddings.forward(&token_type_ids)?;

        let summed = words.broadcast_add(&positions)?.add(&segments)?;
        Ok(self.norm.forward(&summed)?)
    }

    /// The raw word embedding matrix `[vocab_size, hidden_size]`.
    ///
    /// The MLM head decoder is tied to these weights.
    #[must_use]
    pub fn word_embedding_matrix(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }
}
