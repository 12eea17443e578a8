// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer wrapper for BERT-family models.
//!
//! [`ClozeTokenizer`] wraps the `HuggingFace` `tokenizers` crate with the
//! small surface the cloze task needs: encoding with special tokens,
//! id↔token conversion, and the mask token id.

use std::path::Path;

use crate::error::{ClozeError, Result};

/// Mask token spellings tried in order when loading a tokenizer.
const MASK_TOKEN_CANDIDATES: [&str; 2] = ["[MASK]", "<mask>"];

/// Tokenizer with a resolved mask token.
pub struct ClozeTokenizer {
    /// Underlying `HuggingFace` tokenizer.
    inner: Box<tokenizers::Tokenizer>,
    /// The mask token's text (e.g. `[MASK]`).
    mask_token: String,
    /// The mask token's id.
    mask_token_id: u32,
}

impl ClozeTokenizer {
    /// Load from a `tokenizer.json` file and resolve the mask token.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Tokenizer`] if the file cannot be loaded or
    /// the vocabulary has no mask token.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            ClozeError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_tokenizer(inner)
    }

    /// Wrap an already-loaded tokenizer.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Tokenizer`] if the vocabulary has no mask
    /// token.
    pub fn from_tokenizer(inner: tokenizers::Tokenizer) -> Result<Self> {
        let (mask_token, mask_token_id) = MASK_TOKEN_CANDIDATES
            .iter()
            .find_map(|&token| inner.token_to_id(token).map(|id| (token.to_string(), id)))
            .ok_or_else(|| {
                ClozeError::Tokenizer(format!(
                    "vocabulary has no mask token (tried {MASK_TOKEN_CANDIDATES:?})"
                ))
            })?;
        Ok(Self {
            inner: Box::new(inner),
            mask_token,
            mask_token_id,
        })
    }

    /// The mask token's text.
    #[must_use]
    pub fn mask_token(&self) -> &str {
        &self.mask_token
    }

    /// The mask token's id.
    #[must_use]
    pub const fn mask_token_id(&self) -> u32 {
        self.mask_token_id
    }

    /// Encode text into parallel token strings and ids, with special
    /// tokens added per the tokenizer's post-processor (`[CLS]`/`[SEP]`
    /// for BERT).
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<(Vec<String>, Vec<u32>)> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ClozeError::Tokenizer(format!("encode failed: {e}")))?;
        Ok((encoding.get_tokens().to_vec(), encoding.get_ids().to_vec()))
    }

    /// The token string for a single id.
    ///
    /// # Errors
    ///
    /// Returns [`ClozeError::Tokenizer`] if the id is not in the
    /// vocabulary.
    pub fn id_to_token(&self, id: u32) -> Result<String> {
        self.inner
            .id_to_token(id)
            .ok_or_else(|| ClozeError::Tokenizer(format!("id {id} not in vocabulary")))
    }

    /// Vocabulary size, including added special tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for ClozeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClozeTokenizer")
            .field("mask_token", &self.mask_token)
            .field("mask_token_id", &self.mask_token_id)
            .finish_non_exhaustive()
    }
}
