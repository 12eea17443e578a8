// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT feed-forward block: intermediate GELU expansion, output
//! projection, residual layer norm.

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::config::{Activation, BertConfig};
use crate::error::Result;

/// The feed-forward sub-block of one encoder layer (`intermediate` +
/// `output` in the HF checkpoint).
pub struct FeedForward {
    /// Expansion projection (`intermediate.dense`).
    intermediate: Linear,
    /// Contraction projection (`output.dense`).
    output: Linear,
    /// Residual layer norm (`output.LayerNorm`).
    norm: LayerNorm,
    /// Activation applied after the expansion.
    activation: Activation,
}

impl FeedForward {
    /// Load from a [`VarBuilder`] rooted at one encoder layer.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &BertConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let intermediate = candle_nn::linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
        )?;
        let vb_out = vb.pp("output");
        let output = candle_nn::linear(
            config.intermediate_size,
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
            intermediate,
            output,
            norm,
            activation: config.activation,
        })
    }

    /// Feed-forward forward pass with residual add and layer norm.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Model`](crate::ClozeError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = apply_activation(&self.intermediate.forward(x)?, self.activation)?;
        let projected = self.output.forward(&hidden)?;
        Ok(self.norm.forward(&(projected + x)?)?)
    }
}

/// Apply the selected activation function.
pub(crate) fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Gelu => Ok(x.gelu_erf()?),
        Activation::GeluApprox => Ok(x.gelu()?),
    }
}
