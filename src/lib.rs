// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cloze prediction and attention inspection for BERT-family models on
//! [candle](https://github.com/huggingface/candle).
//!
//! A cloze module fills blanks (`_`) in a sentence with the model's most
//! probable tokens while capturing the full attention probabilities of
//! the forward pass, one `[heads, seq, seq]` tensor per layer.  The
//! captured pass can then be queried pointwise: how much does token A
//! attend to token B, aggregated over layers and heads by a selectable
//! mix mode.
//!
//! # Quick start
//!
//! ```no_run
//! use candle_cloze::{BertCloze, ClozeBackend};
//!
//! # fn main() -> candle_cloze::Result<()> {
//! let mut module = BertCloze::english();
//! module.load()?;
//! module.forward("The cat sat on the _.")?;
//! println!("{:?}", module.output()?);
//! let w = module.attention_weights("cat", "sat", "average", "average")?;
//! println!("cat -> sat attention: {w}");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`module`]: the [`ClozeBackend`] capability trait and the BERT
//!   implementation, [`BertCloze`].
//! - [`encoder`]: the masked LM forward pass on candle.
//! - [`capture`]: the [`AttentionObserver`] seam and the per-pass
//!   [`AttentionBuffer`].
//! - [`mixer`]: layer/head aggregation of captured attention.
//! - [`sentence`], [`tokenizer`]: token-level views of the input.
//! - [`config`], [`download`]: HF config parsing and artifact fetch.

#![warn(missing_docs)]

pub mod capture;
pub mod config;
pub mod download;
pub mod encoder;
pub mod error;
pub mod mixer;
pub mod module;
pub mod sentence;
pub mod tokenizer;

pub use capture::{AttentionBuffer, AttentionObserver, BufferObserver};
pub use config::{Activation, BertConfig};
pub use download::{fetch_model, ModelFiles};
pub use encoder::BertMaskedLm;
pub use error::{ClozeError, Result};
pub use mixer::{HeadMixMode, LayerMixMode};
pub use module::{BertCloze, ClozeBackend, BLANK_MARKER};
pub use sentence::TokenSentence;
pub use tokenizer::ClozeTokenizer;
