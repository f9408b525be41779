//! Model loading and inference.
//!
//! Provides the pieces of a llama2-style decoder:
//! - Checkpoint loading into zero-copy tensor views
//! - KV cache and the single-token forward pass
//! - Normalization, rotary embeddings and compute kernels
//! - A cache-free reference forward pass on candle tensors

mod checkpoint;
mod config;
pub mod kernels;
mod kv_cache;
mod reference;
mod rmsnorm;
mod rope;
mod transformer;

pub use checkpoint::{Checkpoint, LayerWeights, TensorView, WeightSet, HEADER_LEN};
pub use config::{ModelConfig, DEFAULT_RMS_NORM_EPS, DEFAULT_ROPE_THETA};
pub use kernels::{ComputeBackend, ParallelBackend, SequentialBackend};
pub use kv_cache::KvCache;
pub use reference::ReferenceTransformer;
pub use rmsnorm::{rmsnorm, RmsNorm};
pub use rope::RotaryEmbedding;
pub use transformer::Transformer;
