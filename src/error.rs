// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-cloze.

/// Errors that can occur during cloze operations.
#[derive(Debug, thiserror::Error)]
pub enum ClozeError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model configuration parsing error, or a capture shape mismatch
    /// indicating the attention sub-module layout is not the expected one.
    #[error("config error: {0}")]
    Config(String),

    /// Model or tokenizer artifact acquisition failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Operation issued in the wrong lifecycle state (e.g. a query before
    /// any forward pass, or a forward pass before `load()`).
    #[error("state error: {0}")]
    State(String),

    /// Unrecognized layer or head mix mode.
    #[error("mode error: {0}")]
    Mode(String),

    /// Token text not present in the current sentence.
    #[error("token error: {0}")]
    Token(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-cloze operations.
pub type Result<T> = std::result::Result<T, ClozeError>;
