//! Checkpoint loading.
//!
//! A checkpoint is a 28-byte header of seven native-endian `i32` fields
//! followed by every weight tensor as row-major `f32`:
//!
//! | field | meaning |
//! |-------|---------|
//! | 0 | hidden size |
//! | 1 | intermediate size |
//! | 2 | layer count |
//! | 3 | attention heads |
//! | 4 | key/value heads |
//! | 5 | vocabulary size (negative: classifier stored separately) |
//! | 6 | maximum sequence length |
//!
//! The file is memory-mapped and every tensor is exposed as a [`TensorView`],
//! an `(offset, rows, cols)` window into one `f32` arena. Nothing is copied.
//!
//! # Example
//!
//! ```ignore
//! use axon_core::model::Checkpoint;
//!
//! let checkpoint = Checkpoint::open("stories15M.bin")?;
//! let embeddings = checkpoint.tensor(checkpoint.weights().embed_tokens);
//! ```

use super::config::{ModelConfig, DEFAULT_RMS_NORM_EPS, DEFAULT_ROPE_THETA};
use crate::error::{AxonError, Result};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Size of the checkpoint header in bytes.
pub const HEADER_LEN: usize = 7 * std::mem::size_of::<i32>();

const F32_LEN: usize = std::mem::size_of::<f32>();

/// Non-owning view of one tensor inside the checkpoint arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    offset: usize,
    rows: usize,
    cols: usize,
}

impl TensorView {
    fn new(offset: usize, rows: usize, cols: usize) -> Self {
        Self { offset, rows, cols }
    }

    /// Offset of the first element, in floats.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of rows (output features for projections).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (input features for projections).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Check if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the view against an arena.
    pub fn slice<'a>(&self, arena: &'a [f32]) -> &'a [f32] {
        &arena[self.offset..self.offset + self.len()]
    }
}

/// Tensor views for one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Pre-attention RMSNorm gain: [1, hidden]
    pub input_layernorm: TensorView,
    /// Query projection: [num_heads * head_dim, hidden]
    pub q_proj: TensorView,
    /// Key projection: [num_kv_heads * head_dim, hidden]
    pub k_proj: TensorView,
    /// Value projection: [num_kv_heads * head_dim, hidden]
    pub v_proj: TensorView,
    /// Output projection: [hidden, num_heads * head_dim]
    pub o_proj: TensorView,
    /// Pre-FFN RMSNorm gain: [1, hidden]
    pub post_attention_layernorm: TensorView,
    /// Gate projection: [intermediate, hidden]
    pub gate_proj: TensorView,
    /// Down projection: [hidden, intermediate]
    pub down_proj: TensorView,
    /// Up projection: [intermediate, hidden]
    pub up_proj: TensorView,
}

/// Every tensor of a model, located inside the checkpoint arena.
#[derive(Debug, Clone)]
pub struct WeightSet {
    /// Token embedding table: [vocab, hidden]
    pub embed_tokens: TensorView,
    /// Decoder layers in execution order.
    pub layers: Vec<LayerWeights>,
    /// Final RMSNorm gain: [1, hidden]
    pub norm: TensorView,
    /// Classifier: [vocab, hidden]. Same view as `embed_tokens` when tied.
    pub lm_head: TensorView,
}

impl WeightSet {
    /// Number of floats the arena of `config` must hold.
    ///
    /// Fails with a `Checkpoint` error naming the tensor whose size does not
    /// fit in `usize`, counted in bytes.
    pub fn required_floats(config: &ModelConfig) -> Result<usize> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let kv_dim = config.kv_dim();
        let n_layers = config.num_hidden_layers;
        let vocab = config.vocab_size;

        let mut blocks = vec![
            ("token embeddings", vec![vocab, hidden]),
            ("attention norms", vec![n_layers, hidden]),
            ("query projections", vec![n_layers, hidden, hidden]),
            ("key projections", vec![n_layers, kv_dim, hidden]),
            ("value projections", vec![n_layers, kv_dim, hidden]),
            ("output projections", vec![n_layers, hidden, hidden]),
            ("ffn norms", vec![n_layers, hidden]),
            ("gate projections", vec![n_layers, inter, hidden]),
            ("down projections", vec![n_layers, hidden, inter]),
            ("up projections", vec![n_layers, inter, hidden]),
            ("final norm", vec![hidden]),
            ("rope tables", vec![config.max_position_embeddings, config.head_dim()]),
        ];
        if !config.weights_tied {
            blocks.push(("classifier", vec![vocab, hidden]));
        }

        let mut total = 0usize;
        for (name, dims) in blocks {
            let count = dims
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| overflow(name))?;
            total = total.checked_add(count).ok_or_else(|| overflow(name))?;
        }
        total
            .checked_mul(F32_LEN)
            .ok_or_else(|| overflow("weight arena"))?;
        Ok(total)
    }

    /// Compute tensor locations for a configuration.
    ///
    /// Returns the views and the number of floats the arena must hold.
    pub fn layout(config: &ModelConfig) -> Result<(Self, usize)> {
        let floats = Self::required_floats(config)?;

        // Every offset below is bounded by `floats`, which fits in bytes.
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let kv_dim = config.kv_dim();
        let n_layers = config.num_hidden_layers;
        let vocab = config.vocab_size;

        let mut cursor = 0usize;
        let mut block = |count: usize| {
            let start = cursor;
            cursor += count;
            start
        };

        let embed_tokens = TensorView::new(block(vocab * hidden), vocab, hidden);
        // Each role is stored for all layers back to back.
        let attn_norm = block(n_layers * hidden);
        let wq = block(n_layers * hidden * hidden);
        let wk = block(n_layers * kv_dim * hidden);
        let wv = block(n_layers * kv_dim * hidden);
        let wo = block(n_layers * hidden * hidden);
        let ffn_norm = block(n_layers * hidden);
        let w1 = block(n_layers * inter * hidden);
        let w2 = block(n_layers * hidden * inter);
        let w3 = block(n_layers * inter * hidden);
        let norm = TensorView::new(block(hidden), 1, hidden);
        // Legacy RoPE tables: real and imaginary halves, recomputed at runtime.
        block(config.max_position_embeddings * config.head_dim());
        let lm_head = if config.weights_tied {
            embed_tokens
        } else {
            TensorView::new(block(vocab * hidden), vocab, hidden)
        };
        debug_assert_eq!(cursor, floats);

        let layers = (0..n_layers)
            .map(|l| LayerWeights {
                input_layernorm: TensorView::new(attn_norm + l * hidden, 1, hidden),
                q_proj: TensorView::new(wq + l * hidden * hidden, hidden, hidden),
                k_proj: TensorView::new(wk + l * kv_dim * hidden, kv_dim, hidden),
                v_proj: TensorView::new(wv + l * kv_dim * hidden, kv_dim, hidden),
                o_proj: TensorView::new(wo + l * hidden * hidden, hidden, hidden),
                post_attention_layernorm: TensorView::new(ffn_norm + l * hidden, 1, hidden),
                gate_proj: TensorView::new(w1 + l * inter * hidden, inter, hidden),
                down_proj: TensorView::new(w2 + l * hidden * inter, hidden, inter),
                up_proj: TensorView::new(w3 + l * inter * hidden, inter, hidden),
            })
            .collect();

        let weights = Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
        };
        Ok((weights, floats))
    }
}

enum Storage {
    /// Read-only mapping of the checkpoint file.
    Mapped { mmap: Mmap, floats: usize },
    /// Arena built in memory.
    Owned(Vec<f32>),
}

/// A loaded model checkpoint: architecture plus weight arena.
///
/// Share between engines with `Arc<Checkpoint>`; the arena is never written.
pub struct Checkpoint {
    config: ModelConfig,
    weights: WeightSet,
    storage: Storage,
}

impl Checkpoint {
    /// Memory-map a checkpoint file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AxonError::Checkpoint(format!("failed to open {}: {}", path.display(), e))
        })?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_LEN {
            return Err(AxonError::Checkpoint(format!(
                "{} is truncated: {} bytes, header needs {}",
                path.display(),
                file_len,
                HEADER_LEN
            )));
        }

        // SAFETY: the mapping is read-only and the file is not modified while
        // the checkpoint is alive.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            AxonError::Checkpoint(format!("failed to mmap {}: {}", path.display(), e))
        })?;

        let config = parse_header(&mmap)?;
        let payload = &mmap[HEADER_LEN..];
        check_payload_len(payload.len(), WeightSet::required_floats(&config)?)?;
        let (weights, floats) = WeightSet::layout(&config)?;
        bytemuck::try_cast_slice::<u8, f32>(&payload[..floats * F32_LEN]).map_err(|e| {
            AxonError::Checkpoint(format!("weights are not f32-aligned in memory: {}", e))
        })?;

        debug!(
            path = %path.display(),
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            vocab = config.vocab_size,
            tied = config.weights_tied,
            "mapped checkpoint"
        );

        Ok(Self {
            config,
            weights,
            storage: Storage::Mapped { mmap, floats },
        })
    }

    /// Parse an in-memory checkpoint image into owned storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(AxonError::Checkpoint(format!(
                "checkpoint is truncated: {} bytes, header needs {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let config = parse_header(bytes)?;
        let payload = &bytes[HEADER_LEN..];
        check_payload_len(payload.len(), WeightSet::required_floats(&config)?)?;
        let (weights, floats) = WeightSet::layout(&config)?;

        let arena = payload[..floats * F32_LEN]
            .chunks_exact(F32_LEN)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            config,
            weights,
            storage: Storage::Owned(arena),
        })
    }

    /// Build a checkpoint with random weights (for testing).
    ///
    /// Norm gains are drawn near one, every other tensor uniformly from
    /// `[-0.1, 0.1)`. The same seed always yields the same weights.
    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let (weights, floats) = WeightSet::layout(&config)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut arena: Vec<f32> = (0..floats).map(|_| rng.gen_range(-0.1f32..0.1)).collect();

        let mut gains = vec![weights.norm];
        for layer in &weights.layers {
            gains.push(layer.input_layernorm);
            gains.push(layer.post_attention_layernorm);
        }
        for view in gains {
            for value in &mut arena[view.offset()..view.offset() + view.len()] {
                *value += 1.0;
            }
        }

        Ok(Self {
            config,
            weights,
            storage: Storage::Owned(arena),
        })
    }

    /// Architecture descriptor.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Tensor views.
    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    /// The whole weight arena.
    pub fn arena(&self) -> &[f32] {
        match &self.storage {
            Storage::Mapped { mmap, floats } => {
                // Length and alignment were checked when the file was opened.
                bytemuck::cast_slice(&mmap[HEADER_LEN..HEADER_LEN + floats * F32_LEN])
            }
            Storage::Owned(arena) => arena,
        }
    }

    /// Resolve a tensor view.
    pub fn tensor(&self, view: TensorView) -> &[f32] {
        view.slice(self.arena())
    }

    /// Whether the weights live in a file mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped { .. })
    }

    /// Total number of weight parameters (the classifier counted once when tied).
    pub fn num_parameters(&self) -> usize {
        let w = &self.weights;
        let per_layer: usize = w
            .layers
            .iter()
            .map(|l| {
                l.input_layernorm.len()
                    + l.q_proj.len()
                    + l.k_proj.len()
                    + l.v_proj.len()
                    + l.o_proj.len()
                    + l.post_attention_layernorm.len()
                    + l.gate_proj.len()
                    + l.down_proj.len()
                    + l.up_proj.len()
            })
            .sum();
        let head = if self.config.weights_tied {
            0
        } else {
            w.lm_head.len()
        };
        w.embed_tokens.len() + per_layer + w.norm.len() + head
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("config", &self.config)
            .field("mapped", &self.is_mapped())
            .field("floats", &self.arena().len())
            .finish()
    }
}

fn overflow(name: &str) -> AxonError {
    AxonError::Checkpoint(format!(
        "header dimensions overflow: size of {name} does not fit in memory"
    ))
}

fn check_payload_len(available: usize, floats: usize) -> Result<()> {
    let required = floats * F32_LEN;
    if available < required {
        return Err(AxonError::Checkpoint(format!(
            "checkpoint is truncated: weights need {} bytes, found {}",
            required, available
        )));
    }
    Ok(())
}

fn parse_header(bytes: &[u8]) -> Result<ModelConfig> {
    let field = |index: usize| {
        let start = index * 4;
        i32::from_ne_bytes([
            bytes[start],
            bytes[start + 1],
            bytes[start + 2],
            bytes[start + 3],
        ])
    };
    let positive = |index: usize, name: &str| -> Result<usize> {
        let value = field(index);
        if value <= 0 {
            return Err(AxonError::Checkpoint(format!(
                "header field {name} must be positive, found {value}"
            )));
        }
        Ok(value as usize)
    };

    let raw_vocab = field(5);
    if raw_vocab == 0 {
        return Err(AxonError::Checkpoint(
            "header field vocab_size must be non-zero".to_string(),
        ));
    }

    let config = ModelConfig {
        hidden_size: positive(0, "hidden_size")?,
        intermediate_size: positive(1, "intermediate_size")?,
        num_hidden_layers: positive(2, "num_hidden_layers")?,
        num_attention_heads: positive(3, "num_attention_heads")?,
        num_key_value_heads: positive(4, "num_key_value_heads")?,
        vocab_size: raw_vocab.unsigned_abs() as usize,
        max_position_embeddings: positive(6, "max_position_embeddings")?,
        weights_tied: raw_vocab > 0,
        rms_norm_eps: DEFAULT_RMS_NORM_EPS,
        rope_theta: DEFAULT_ROPE_THETA,
    };
    config.validate()?;
    Ok(config)
}
