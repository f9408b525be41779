//! # Axon
//!
//! Single-sequence inference for llama2-style transformer checkpoints.
//!
//! Axon runs small decoder-only models on the CPU:
//! - **Zero-copy loading**: checkpoints are memory-mapped, never copied
//! - **KV-cached decoding**: one token per forward call
//! - **Reproducible sampling**: greedy, temperature and top-p with a fixed seed
//! - **Streaming**: output arrives fragment by fragment
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use axon::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .checkpoint_path("stories15M.bin")
//!         .tokenizer_path("tokenizer.bin")
//!         .build()?;
//!
//!     let result = engine
//!         .generate("Once upon a time")
//!         .temperature(0.7)
//!         .top_p(0.9)
//!         .seed(124)
//!         .execute()?;
//!
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use axon_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};
    pub use crate::{
        error::{AxonError, Result},
        generation::{Fragment, FragmentSource, Generation, GenerationStats},
        model::{Checkpoint, ModelConfig, Transformer},
        sampling::{Sampler, SamplerConfig},
        tokenizer::Tokenizer,
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
