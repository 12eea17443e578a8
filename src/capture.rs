// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention capture: per-forward buffer and the observer that fills it.
//!
//! [`AttentionBuffer`] is the `[layers, heads, seq, seq]` record of one
//! forward pass.  [`AttentionObserver`] is the capability each encoder
//! layer invokes with its own projected query/key tensors and additive
//! mask; [`BufferObserver`] is the concrete observer that recomputes the
//! scaled dot-product attention probabilities and records them.
//!
//! The observer receives the **same** projected tensors the layer uses
//! internally and applies the same candle operations
//! (`softmax(Q·Kᵀ / sqrt(head_dim) + mask)` over the key axis, promoted
//! to F32), so the captured probabilities equal what the model computed.
//! Observation never mutates the layer's own data flow.

use candle_core::{DType, Tensor};

use crate::error::{ClozeError, Result};

// ---------------------------------------------------------------------------
// AttentionBuffer
// ---------------------------------------------------------------------------

/// Post-softmax attention probabilities for one forward pass.
///
/// Logically a `[layers, heads, seq, seq]` tensor where
/// `buffer[l, h, q, k]` is the probability mass query position `q` places
/// on key position `k` in layer `l`, head `h`.  Stored as one
/// `[heads, seq, seq]` slot per layer, filled in layer order as the
/// forward pass runs.  Allocated fresh per forward call and discarded on
/// the next.
///
/// # Example
///
/// ```
/// use candle_cloze::AttentionBuffer;
/// use candle_core::{Device, Tensor};
///
/// let mut buffer = AttentionBuffer::new(1, 2, 4);
/// let pattern = Tensor::full(0.25f32, (2, 4, 4), &Device::Cpu).unwrap();
/// buffer.record(0, pattern).unwrap();
/// assert!(buffer.is_complete());
/// ```
#[derive(Debug)]
pub struct AttentionBuffer {
    /// One `[heads, seq, seq]` pattern per layer; `None` until recorded.
    slots: Vec<Option<Tensor>>,
    /// Expected number of heads per layer.
    num_heads: usize,
    /// Expected sequence length.
    seq_len: usize,
}

impl AttentionBuffer {
    /// Create an empty buffer for `num_layers` layers of
    /// `[num_heads, seq_len, seq_len]` patterns.
    #[must_use]
    pub fn new(num_layers: usize, num_heads: usize, seq_len: usize) -> Self {
        Self {
            slots: (0..num_layers).map(|_| None).collect(),
            num_heads,
            seq_len,
        }
    }

    /// Number of layers the buffer spans.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.slots.len()
    }

    /// Number of heads per layer.
    #[must_use]
    pub const fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Sequence length the buffer was sized to.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Whether every layer slot has been recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Record the attention pattern for one layer.
    ///
    /// # Shapes
    /// - `pattern`: `[heads, seq, seq]`, F32
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Config`] if the layer index or the pattern
    /// shape does not match the buffer dimensions — the attention
    /// sub-module layout is not the one this capture expects.
    pub fn record(&mut self, layer_idx: usize, pattern: Tensor) -> Result<()> {
        let dims = pattern.dims3()?;
        if dims != (self.num_heads, self.seq_len, self.seq_len) {
            return Err(ClozeError::Config(format!(
                "attention pattern shape {dims:?} does not match expected \
                 [{}, {}, {}]",
                self.num_heads, self.seq_len, self.seq_len
            )));
        }
        let num_layers = self.slots.len();
        let slot = self.slots.get_mut(layer_idx).ok_or_else(|| {
            ClozeError::Config(format!(
                "layer index {layer_idx} out of range ({num_layers} layers)"
            ))
        })?;
        *slot = Some(pattern);
        Ok(())
    }

    /// The recorded pattern for one layer.
    ///
    /// # Shapes
    /// - returns: `[heads, seq, seq]`
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::State`] if the layer has not been recorded.
    pub fn layer(&self, layer_idx: usize) -> Result<&Tensor> {
        self.slots
            .get(layer_idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                ClozeError::State(format!("layer {layer_idx} has not been captured"))
            })
    }

    /// Stack all layers into a single `[layers, heads, seq, seq]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::State`] if any layer is missing.
    pub fn stacked(&self) -> Result<Tensor> {
        let mut layers = Vec::with_capacity(self.slots.len());
        for (idx, slot) in self.slots.iter().enumerate() {
            let tensor = slot.as_ref().ok_or_else(|| {
                ClozeError::State(format!("layer {idx} has not been captured"))
            })?;
            layers.push(tensor.clone());
        }
        Ok(Tensor::stack(&layers, 0)?)
    }
}

// ---------------------------------------------------------------------------
// AttentionObserver
// ---------------------------------------------------------------------------

/// Passive observer of a layer's self-attention inputs.
///
/// Each encoder layer calls [`observe`](Self::observe) once per forward
/// pass, after projecting its query and key tensors and before computing
/// its own attention output.  Implementations must not mutate the inputs.
pub trait AttentionObserver {
    /// Observe one layer's projected query/key tensors and additive mask.
    ///
    /// # Shapes
    /// - `query`, `key`: `[batch, heads, seq, head_dim]`
    /// - `mask`: `[1, 1, seq, seq]` additive (`0` keep, `-inf` drop)
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Config`] if the tensors do not have the
    /// expected layout.
    fn observe(
        &mut self,
        layer_idx: usize,
        query: &Tensor,
        key: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<()>;
}

/// Observer that recomputes attention probabilities into an
/// [`AttentionBuffer`].
///
/// Borrows the buffer for the duration of one forward pass; the buffer
/// outlives the observer and is queried afterwards.
pub struct BufferObserver<'a> {
    /// Destination buffer, one slot per layer.
    buffer: &'a mut AttentionBuffer,
}

impl<'a> BufferObserver<'a> {
    /// Bind an observer to a buffer for one forward pass.
    pub fn new(buffer: &'a mut AttentionBuffer) -> Self {
        Self { buffer }
    }
}

impl AttentionObserver for BufferObserver<'_> {
    fn observe(
        &mut self,
        layer_idx: usize,
        query: &Tensor,
        key: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<()> {
        let (_batch, _heads, _seq, head_dim) = query.dims4()?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (head_dim as f64).sqrt();

        // Same math as the layer itself: scores = Q·Kᵀ / sqrt(head_dim) + mask.
        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = key.contiguous()?.transpose(2, 3)?;
        let mut scores = (query.contiguous()?.matmul(&k_t)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let scores = if scores.dtype() == DType::F32 {
            scores
        } else {
            scores.to_dtype(DType::F32)?
        };
        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;

        // Drop the batch dimension: [1, heads, seq, seq] → [heads, seq, seq].
        self.buffer.record(layer_idx, pattern.squeeze(0)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn empty_buffer_is_incomplete() {
        let buffer = AttentionBuffer::new(2, 4, 6);
        assert_eq!(buffer.num_layers(), 2);
        assert_eq!(buffer.num_heads(), 4);
        assert_eq!(buffer.seq_len(), 6);
        assert!(!buffer.is_complete());
        assert!(buffer.layer(0).is_err());
        assert!(buffer.stacked().is_err());
    }

    #[test]
    fn record_and_stack() {
        let device = Device::Cpu;
        let mut buffer = AttentionBuffer::new(2, 2, 3);
        for layer in 0..2 {
            let pattern = Tensor::full(1.0 / 3.0f32, (2, 3, 3), &device).unwrap();
            buffer.record(layer, pattern).unwrap();
        }
        assert!(buffer.is_complete());
        assert_eq!(buffer.stacked().unwrap().dims(), &[2, 2, 3, 3]);
    }

    #[test]
    fn record_rejects_wrong_shape() {
        let device = Device::Cpu;
        let mut buffer = AttentionBuffer::new(1, 2, 3);
        let wrong = Tensor::zeros((4, 3, 3), DType::F32, &device).unwrap();
        assert!(buffer.record(0, wrong).is_err());
    }

    #[test]
    fn record_rejects_out_of_range_layer() {
        let device = Device::Cpu;
        let mut buffer = AttentionBuffer::new(1, 2, 3);
        let pattern = Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap();
        assert!(buffer.record(5, pattern).is_err());
    }

    #[test]
    fn observer_rows_are_stochastic() {
        let device = Device::Cpu;
        let mut buffer = AttentionBuffer::new(1, 2, 4);
        {
            let mut observer = BufferObserver::new(&mut buffer);

            // Arbitrary projected Q/K: [batch=1, heads=2, seq=4, head_dim=3].
            let query = Tensor::rand(-1.0f32, 1.0, (1, 2, 4, 3), &device).unwrap();
            let key = Tensor::rand(-1.0f32, 1.0, (1, 2, 4, 3), &device).unwrap();
            observer.observe(0, &query, &key, None).unwrap();
        }

        let pattern = buffer.layer(0).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = pattern.to_vec3().unwrap();
        for head in &rows {
            for row in head {
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-4, "row sum {sum} not ~1");
            }
        }
    }

    #[test]
    fn observer_matches_manual_softmax() {
        let device = Device::Cpu;

        // One head, two positions, head_dim 1: scores are just q*k / 1.
        let query = Tensor::new(&[[[[1.0f32], [2.0]]]], &device).unwrap();
        let key = Tensor::new(&[[[[1.0f32], [3.0]]]], &device).unwrap();

        let mut buffer = AttentionBuffer::new(1, 1, 2);
        BufferObserver::new(&mut buffer)
            .observe(0, &query, &key, None)
            .unwrap();

        // Row 0 scores: [1*1, 1*3] = [1, 3] → softmax = [e^1, e^3] / Z.
        let expected0 = {
            let z = 1.0f32.exp() + 3.0f32.exp();
            [1.0f32.exp() / z, 3.0f32.exp() / z]
        };
        let rows: Vec<Vec<Vec<f32>>> = buffer.layer(0).unwrap().to_vec3().unwrap();
        assert!((rows[0][0][0] - expected0[0]).abs() < 1e-6);
        assert!((rows[0][0][1] - expected0[1]).abs() < 1e-6);
    }

    #[test]
    fn observer_applies_additive_mask() {
        let device = Device::Cpu;
        let query = Tensor::rand(-1.0f32, 1.0, (1, 1, 2, 2), &device).unwrap();
        let key = Tensor::rand(-1.0f32, 1.0, (1, 1, 2, 2), &device).unwrap();

        // Mask out key position 1 for every query.
        let mask = Tensor::new(
            &[[[[0.0f32, f32::NEG_INFINITY], [0.0, f32::NEG_INFINITY]]]],
            &device,
        )
        .unwrap();

        let mut buffer = AttentionBuffer::new(1, 1, 2);
        BufferObserver::new(&mut buffer)
            .observe(0, &query, &key, Some(&mask))
            .unwrap();

        let rows: Vec<Vec<Vec<f32>>> = buffer.layer(0).unwrap().to_vec3().unwrap();
        for row in &rows[0] {
            assert!((row[0] - 1.0).abs() < 1e-6);
            assert!(row[1].abs() < 1e-6);
        }
    }
}
