// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT self-attention with observer capture.
//!
//! The projected query/key tensors are handed to an
//! [`AttentionObserver`] before the layer's own score computation, so
//! the observer can recompute the exact probabilities the layer is about
//! to use.  Observation never alters the layer's data flow.

use candle_core::{DType, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::capture::AttentionObserver;
use crate::config::BertConfig;
use crate::error::Result;

// ---------------------------------------------------------------------------
// SelfAttention
// ---------------------------------------------------------------------------

/// Multi-head self-attention (`attention.self` in the HF checkpoint).
pub struct SelfAttention {
    /// Query projection.
    query: Linear,
    /// Key projection.
    key: Linear,
    /// Value projection.
    value: Linear,
    /// Number of attention heads.
    num_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// Attention scale factor `1/sqrt(head_dim)`.
    scale: f64,
}

impl SelfAttention {
    /// Load Q/K/V projections from a [`VarBuilder`] rooted at
    /// `attention.self`.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let all_head_dim = config.num_attention_heads * config.head_dim;
        let query = candle_nn::linear(config.hidden_size, all_head_dim, vb.pp("query"))?;
        let key = candle_nn::linear(config.hidden_size, all_head_dim, vb.pp("key"))?;
        let value = candle_nn::linear(config.hidden_size, all_head_dim, vb.pp("value"))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            query,
            key,
            value,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim,
            scale,
        })
    }

    /// Run self-attention, letting the observer see the projected Q/K
    /// and mask before the layer's own score computation.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - `mask`: `[1, 1, seq, seq]` -- additive (`0` keep, `-inf` drop)
    /// - returns: `[batch, seq, hidden_size]` -- concatenated head outputs
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) on tensor
    /// operation failures, or the observer's error if observation fails.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_idx: usize,
        observer: Option<&mut dyn AttentionObserver>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = x.dims3()?;

        // --- QKV projection ---
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;

        // Reshape to [batch, seq, heads, head_dim], transpose to [batch, heads, seq, head_dim].
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;

        // The observer sees the layer's own projected tensors, so its
        // recomputed probabilities match what the layer computes below.
        if let Some(observer) = observer {
            observer.observe(layer_idx, &q, &k, Some(mask))?;
        }

        // --- Attention scores ---
        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = k.contiguous()?.transpose(2, 3)?;
        let q = q.contiguous()?;

        let scores = q.matmul(&k_t)?;
        let scores = (scores * self.scale)?;
        let scores = scores.broadcast_add(mask)?;

        // Softmax
        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let scores_f32 = if original_dtype == DType::F32 {
            scores
        } else {
            scores.to_dtype(DType::F32)?
        };
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores_f32)?;
        if original_dtype != DType::F32 {
            pattern = pattern.to_dtype(original_dtype)?;
        }

        // --- Attention output ---
        let v = v.contiguous()?;
        let context = pattern.matmul(&v)?;

        // Back to [batch, seq, heads * head_dim].
        Ok(context.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            seq_len,
            self.num_heads * self.head_dim,
        ))?)
    }
}

// ---------------------------------------------------------------------------
// AttentionBlock
// ---------------------------------------------------------------------------

/// Self-attention plus its output projection and residual layer norm
/// (`attention` in the HF checkpoint).
pub struct AttentionBlock {
    /// The multi-head self-attention step.
    self_attn: SelfAttention,
    /// Output projection (`attention.output.dense`).
    output: Linear,
    /// Residual layer norm (`attention.output.LayerNorm`).
    norm: LayerNorm,
}

impl AttentionBlock {
    /// Load from a [`VarBuilder`] rooted at a layer's `attention`.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let self_attn = SelfAttention::load(config, vb.pp("self"))?;
        let vb_out = vb.pp("output");
        let output = candle_nn::linear(
            config.hidden_size,
            config.hidden_size,
            vb_out.pp("dense"),
        )?;
        let norm = candle_nn::layer_norm(
            config.hidden_size,
            candle_nn::LayerNormConfig {
                eps: config.layer_norm_eps,
                ..Default::default()
            },
            vb_out.pp("LayerNorm"),
        )?;
        Ok(Self {
            self_attn,
            output,
            norm,
        })
    }

    /// Attention block forward: self-attention, output projection,
    /// residual add, layer norm.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) on tensor
    /// operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_idx: usize,
        observer: Option<&mut dyn AttentionObserver>,
    ) -> Result<Tensor> {
        let context = self.self_attn.forward(x, mask, layer_idx, observer)?;
        let projected = self.output.forward(&context)?;
        Ok(self.norm.forward(&(projected + x)?)?)
    }
}
