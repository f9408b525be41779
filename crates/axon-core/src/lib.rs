//! # Axon Core
//!
//! Single-sequence inference engine for llama2-style checkpoints.
//!
//! This crate provides:
//! - **Checkpoint loading** by memory map, with zero-copy tensor views
//! - **Forward pass** for one token at a time over a KV cache, with
//!   sequential and rayon-parallel compute backends
//! - **BPE tokenizer** reading the llama2 vocabulary format
//! - **Sampling**: greedy, temperature and nucleus (top-p) with a seedable
//!   xorshift generator
//! - **Generation loop** that streams output fragments

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;
pub mod sampling;
pub mod tokenizer;

#[cfg(test)]
pub(crate) mod test_factory;

pub use error::{AxonError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{AxonError, Result};
    pub use crate::generation::{Fragment, FragmentSource, Generation, GenerationStats};
    pub use crate::model::{
        Checkpoint, ComputeBackend, ModelConfig, ParallelBackend, SequentialBackend, Transformer,
    };
    pub use crate::sampling::{Sampler, SamplerConfig, XorShiftRng};
    pub use crate::tokenizer::Tokenizer;
}
