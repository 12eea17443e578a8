// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention mixing: reduce a stacked `[layers, heads, seq, seq]`
//! attention tensor to a scalar (or per-head vector) for one
//! (key, query) token pair.
//!
//! The stack is produced once per forward pass from the capture buffer
//! ([`AttentionBuffer::stacked`](crate::AttentionBuffer::stacked)); the
//! queries here only index and reduce it.
//!
//! The head axis is reduced first (`average` eagerly, `first` as an
//! index), then the layer axis.  Mean and single-index selection commute
//! across the two disjoint axes, so the order never changes the numeric
//! result; applying the head average first simply mirrors the reference
//! computation.
//!
//! The final lookup indexes the reduced `[seq, seq]` tensor at
//! `[key_pos, query_pos]` — key on the row axis, query on the column
//! axis, matching the reference convention.

use std::fmt;
use std::str::FromStr;

use candle_core::{IndexOp, Tensor};

use crate::error::{ClozeError, Result};

// ---------------------------------------------------------------------------
// Mix modes
// ---------------------------------------------------------------------------

/// Policy for collapsing the layer axis of captured attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)] // fixed mixing algebra; new modes are a breaking change
pub enum LayerMixMode {
    /// Layer 0 only.
    First,
    /// The last layer only.
    Final,
    /// Arithmetic mean over all layers.
    Average,
}

impl LayerMixMode {
    /// All supported modes, in presentation order.
    pub const ALL: [Self; 3] = [Self::First, Self::Final, Self::Average];
}

impl fmt::Display for LayerMixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Final => write!(f, "final"),
            Self::Average => write!(f, "average"),
        }
    }
}

impl FromStr for LayerMixMode {
    type Err = ClozeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(Self::First),
            "final" => Ok(Self::Final),
            "average" => Ok(Self::Average),
            other => Err(ClozeError::Mode(format!(
                "unsupported layer mix mode: {other}"
            ))),
        }
    }
}

/// Policy for collapsing the head axis of captured attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)] // fixed mixing algebra; new modes are a breaking change
pub enum HeadMixMode {
    /// Head 0 only.
    First,
    /// Arithmetic mean over all heads.
    Average,
    /// Keep the head axis: the result is one value per head.
    All,
}

impl HeadMixMode {
    /// All supported modes, in presentation order.
    pub const ALL: [Self; 3] = [Self::First, Self::Average, Self::All];
}

impl fmt::Display for HeadMixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Average => write!(f, "average"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for HeadMixMode {
    type Err = ClozeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(Self::First),
            "average" => Ok(Self::Average),
            "all" => Ok(Self::All),
            other => Err(ClozeError::Mode(format!(
                "unsupported head mix mode: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Weight queries
// ---------------------------------------------------------------------------

/// Scalar attention weight for one (key, query) position pair.
///
/// `attention[l, h, q, k]` holds the probability mass query `q` places
/// on key `k`; the returned scalar is that tensor reduced per the two
/// modes and indexed at `[key_pos, query_pos]`.
///
/// # Shapes
/// - `attention`: `[layers, heads, seq, seq]`
///
/// # Errors
///
/// - [`ClozeError::Mode`] when `head_mode` is [`HeadMixMode::All`] — no
///   scalar head reduction is defined for it; use [`weight_per_head`].
/// - [`ClozeError::Config`] if a position is out of range.
pub fn weight(
    attention: &Tensor,
    key_pos: usize,
    query_pos: usize,
    layer_mode: LayerMixMode,
    head_mode: HeadMixMode,
) -> Result<f32> {
    let (num_layers, _heads, seq_len, _) = attention.dims4()?;
    check_positions(seq_len, key_pos, query_pos)?;

    let head_reduced = match head_mode {
        HeadMixMode::All => {
            return Err(ClozeError::Mode(
                "head mix mode `all` yields one value per head; \
                 use the per-head query for it"
                    .into(),
            ));
        }
        // Head average happens before the layer step: [L, H, T, T] → [L, T, T].
        HeadMixMode::Average => reduce_layers(&attention.mean(1)?, layer_mode, num_layers)?,
        HeadMixMode::First => reduce_layers(attention, layer_mode, num_layers)?.i(0)?,
    };

    // head_reduced: [T, T]; index [key, query].
    Ok(head_reduced.i((key_pos, query_pos))?.to_scalar::<f32>()?)
}

/// Per-head attention weights for one (key, query) position pair.
///
/// The layer reduction is applied independently per head; the head axis
/// is kept, so the result has one entry per attention head.
///
/// # Shapes
/// - `attention`: `[layers, heads, seq, seq]`
///
/// # Errors
///
/// Returns [`ClozeError::Config`] if a position is out of range.
pub fn weight_per_head(
    attention: &Tensor,
    key_pos: usize,
    query_pos: usize,
    layer_mode: LayerMixMode,
) -> Result<Vec<f32>> {
    let (num_layers, _heads, seq_len, _) = attention.dims4()?;
    check_positions(seq_len, key_pos, query_pos)?;

    // [L, H, T, T] → [H, T, T] → [H] at [key, query].
    let per_head = reduce_layers(attention, layer_mode, num_layers)?;
    let values = per_head
        .narrow(1, key_pos, 1)?
        .narrow(2, query_pos, 1)?
        .flatten_all()?;
    Ok(values.to_vec1()?)
}

/// Apply the layer rule to the leading axis of `tensor`.
fn reduce_layers(tensor: &Tensor, layer_mode: LayerMixMode, num_layers: usize) -> Result<Tensor> {
    match layer_mode {
        LayerMixMode::First => Ok(tensor.i(0)?),
        LayerMixMode::Final => Ok(tensor.i(num_layers - 1)?),
        LayerMixMode::Average => Ok(tensor.mean(0)?),
    }
}

/// Validate a (key, query) position pair against the sequence length.
fn check_positions(seq_len: usize, key_pos: usize, query_pos: usize) -> Result<()> {
    if key_pos >= seq_len || query_pos >= seq_len {
        return Err(ClozeError::Config(format!(
            "position pair ({key_pos}, {query_pos}) out of range (seq_len={seq_len})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Two layers, two heads, three positions, with distinct values per
    /// (layer, head) so every mode combination is distinguishable.
    ///
    /// `attention[l, h, q, k] = base(l, h) + 0.01 * q + 0.001 * k` with
    /// `base(0,0)=0.1, base(0,1)=0.2, base(1,0)=0.3, base(1,1)=0.4`.
    /// (Rows are not normalized; the mixer does not require it.)
    fn sample_stack() -> Tensor {
        let mut data = Vec::with_capacity(2 * 2 * 3 * 3);
        for layer in 0..2usize {
            for head in 0..2usize {
                for q in 0..3usize {
                    for k in 0..3usize {
                        data.push(cell(layer, head, q, k));
                    }
                }
            }
        }
        Tensor::from_vec(data, (2, 2, 3, 3), &Device::Cpu).unwrap()
    }

    fn cell(layer: usize, head: usize, q: usize, k: usize) -> f32 {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        {
            0.1 + 0.1 * (2 * layer + head) as f32 + 0.01 * q as f32 + 0.001 * k as f32
        }
    }

    #[test]
    fn mode_parsing_roundtrip() {
        for mode in LayerMixMode::ALL {
            assert_eq!(mode.to_string().parse::<LayerMixMode>().unwrap(), mode);
        }
        for mode in HeadMixMode::ALL {
            assert_eq!(mode.to_string().parse::<HeadMixMode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_modes_error_with_name() {
        let err = "median".parse::<LayerMixMode>().unwrap_err();
        assert!(err.to_string().contains("median"));
        let err = "max".parse::<HeadMixMode>().unwrap_err();
        assert!(err.to_string().contains("max"));
    }

    #[test]
    fn first_first_is_exact_indexing() {
        let stack = sample_stack();
        let got = weight(&stack, 1, 2, LayerMixMode::First, HeadMixMode::First).unwrap();
        assert_eq!(got, cell(0, 0, 1, 2));
    }

    #[test]
    fn final_first_selects_last_layer() {
        let stack = sample_stack();
        let got = weight(&stack, 0, 1, LayerMixMode::Final, HeadMixMode::First).unwrap();
        assert_eq!(got, cell(1, 0, 0, 1));
    }

    #[test]
    fn average_average_is_grand_mean() {
        let stack = sample_stack();
        let got = weight(&stack, 2, 0, LayerMixMode::Average, HeadMixMode::Average).unwrap();
        let expected = (cell(0, 0, 2, 0) + cell(0, 1, 2, 0) + cell(1, 0, 2, 0) + cell(1, 1, 2, 0))
            / 4.0;
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn head_average_layer_final() {
        let stack = sample_stack();
        let got = weight(&stack, 1, 1, LayerMixMode::Final, HeadMixMode::Average).unwrap();
        let expected = (cell(1, 0, 1, 1) + cell(1, 1, 1, 1)) / 2.0;
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn scalar_query_rejects_head_all() {
        let stack = sample_stack();
        let err = weight(&stack, 0, 0, LayerMixMode::First, HeadMixMode::All).unwrap_err();
        assert!(matches!(err, ClozeError::Mode(_)));
    }

    #[test]
    fn per_head_keeps_head_axis() {
        let stack = sample_stack();
        let got = weight_per_head(&stack, 2, 1, LayerMixMode::First).unwrap();
        assert_eq!(got.len(), 2);
        assert!((got[0] - cell(0, 0, 2, 1)).abs() < 1e-6);
        assert!((got[1] - cell(0, 1, 2, 1)).abs() < 1e-6);
    }

    #[test]
    fn per_head_layer_average() {
        let stack = sample_stack();
        let got = weight_per_head(&stack, 0, 0, LayerMixMode::Average).unwrap();
        assert!((got[0] - (cell(0, 0, 0, 0) + cell(1, 0, 0, 0)) / 2.0).abs() < 1e-6);
        assert!((got[1] - (cell(0, 1, 0, 0) + cell(1, 1, 0, 0)) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_position_errors() {
        let stack = sample_stack();
        assert!(weight(&stack, 9, 0, LayerMixMode::First, HeadMixMode::First).is_err());
        assert!(weight_per_head(&stack, 0, 9, LayerMixMode::First).is_err());
    }

    #[test]
    fn queries_reuse_one_stack() {
        // Two queries against the same stacked tensor: no re-stacking,
        // consistent results.
        let stack = sample_stack();
        let a = weight(&stack, 0, 0, LayerMixMode::First, HeadMixMode::First).unwrap();
        let b = weight(&stack, 0, 0, LayerMixMode::First, HeadMixMode::First).unwrap();
        assert_eq!(a, b);
    }
}
