// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenized sentence value type.
//!
//! [`TokenSentence`] holds the token strings, token ids, mask positions,
//! and token→position lookup for the sentence processed by the most
//! recent forward pass.  A fresh instance is built per forward call and
//! replaces the previous one wholesale.

use std::collections::HashMap;

/// A tokenized sentence, including special/boundary tokens.
///
/// The token→position map keeps the **last** occurrence when the same
/// token text appears more than once, so attention queries over repeated
/// words resolve to the final position.  Known limitation, kept to match
/// the reference behavior.
#[derive(Debug, Clone)]
pub struct TokenSentence {
    /// Token strings in order.
    tokens: Vec<String>,
    /// Parallel token ids.
    ids: Vec<u32>,
    /// Token text → position (last occurrence wins).
    positions: HashMap<String, usize>,
    /// Positions whose token id equals the mask token id, in order.
    mask_positions: Vec<usize>,
}

impl TokenSentence {
    /// Build a sentence from parallel token/id sequences and the mask id.
    ///
    /// # Panics
    ///
    /// Does not panic; if `tokens` and `ids` differ in length the shorter
    /// of the two bounds the sentence.
    #[must_use]
    pub fn new(tokens: Vec<String>, ids: Vec<u32>, mask_token_id: u32) -> Self {
        let len = tokens.len().min(ids.len());
        let mut positions = HashMap::with_capacity(len);
        for (pos, token) in tokens.iter().take(len).enumerate() {
            positions.insert(token.clone(), pos);
        }
        let mask_positions = ids
            .iter()
            .take(len)
            .enumerate()
            .filter_map(|(pos, &id)| (id == mask_token_id).then_some(pos))
            .collect();
        Self {
            tokens,
            ids,
            positions,
            mask_positions,
        }
    }

    /// Token strings in order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Token ids in order.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Number of tokens (including special tokens).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sentence has no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Position of a token text, or `None` if not present.
    #[must_use]
    pub fn position_of(&self, token: &str) -> Option<usize> {
        self.positions.get(token).copied()
    }

    /// Positions of mask tokens, left to right.
    #[must_use]
    pub fn mask_positions(&self) -> &[usize] {
        &self.mask_positions
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    #[test]
    fn positions_and_masks() {
        let sentence = TokenSentence::new(
            strings(&["[CLS]", "the", "cat", "[MASK]", ".", "[SEP]"]),
            vec![101, 1996, 4937, 103, 1012, 102],
            103,
        );
        assert_eq!(sentence.len(), 6);
        assert_eq!(sentence.position_of("cat"), Some(2));
        assert_eq!(sentence.position_of("dog"), None);
        assert_eq!(sentence.mask_positions(), &[3]);
    }

    #[test]
    fn duplicate_token_keeps_last_position() {
        let sentence = TokenSentence::new(
            strings(&["[CLS]", "the", "cat", "the", "[SEP]"]),
            vec![101, 1996, 4937, 1996, 102],
            103,
        );
        assert_eq!(sentence.position_of("the"), Some(3));
    }

    #[test]
    fn no_masks() {
        let sentence = TokenSentence::new(
            strings(&["[CLS]", "hello", "[SEP]"]),
            vec![101, 7592, 102],
            103,
        );
        assert!(sentence.mask_positions().is_empty());
        assert!(!sentence.is_empty());
    }

    #[test]
    fn multiple_masks_in_order() {
        let sentence = TokenSentence::new(
            strings(&["[CLS]", "[MASK]", "and", "[MASK]", "[SEP]"]),
            vec![101, 103, 1998, 103, 102],
            103,
        );
        assert_eq!(sentence.mask_positions(), &[1, 3]);
    }
}
