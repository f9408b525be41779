//! Error types for Axon Core.

use thiserror::Error;

/// Result type alias for Axon operations.
pub type Result<T> = std::result::Result<T, AxonError>;

/// Errors that can occur in Axon operations.
#[derive(Error, Debug)]
pub enum AxonError {
    /// Malformed, truncated or unreadable model checkpoint.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Malformed or unreadable tokenizer vocabulary.
    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    /// Forward call issued out of position order.
    #[error("sequence error: expected position {expected}, got {actual}")]
    Sequence {
        /// Position the KV cache expects next.
        expected: usize,
        /// Position the caller asked for.
        actual: usize,
    },

    /// Position does not fit in the KV cache.
    #[error("capacity exceeded: position {position} >= max sequence length {max_seq_len}")]
    Capacity {
        /// Requested position.
        position: usize,
        /// Maximum sequence length of the model.
        max_seq_len: usize,
    },

    /// Token id outside the vocabulary.
    #[error("invalid token id {token} for vocabulary of {vocab_size}")]
    InvalidToken {
        /// Offending token id.
        token: u32,
        /// Vocabulary size of the model.
        vocab_size: usize,
    },

    /// Invalid caller-supplied parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
