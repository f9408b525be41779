//! Model configuration.

use crate::error::{AxonError, Result};
use serde::{Deserialize, Serialize};

/// Epsilon used by every RMSNorm in llama2-style checkpoints.
pub const DEFAULT_RMS_NORM_EPS: f32 = 1e-5;

/// Base frequency for rotary embeddings.
pub const DEFAULT_ROPE_THETA: f32 = 10000.0;

/// Architecture descriptor of a decoder-only transformer.
///
/// Decoded from the checkpoint header; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden (embedding) dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_key_value_heads: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Whether the classifier reuses the token embedding table.
    pub weights_tied: bool,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
}

fn default_rms_norm_eps() -> f32 {
    DEFAULT_RMS_NORM_EPS
}

fn default_rope_theta() -> f32 {
    DEFAULT_ROPE_THETA
}

impl ModelConfig {
    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Width of the key/value projections.
    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.num_key_value_heads
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Check that the dimensions describe a buildable model.
    ///
    /// Every failure names the offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(AxonError::Checkpoint(format!("{field} must be positive")));
            }
        }

        if self.num_key_value_heads > self.num_attention_heads {
            return Err(AxonError::Checkpoint(format!(
                "num_key_value_heads ({}) exceeds num_attention_heads ({})",
                self.num_key_value_heads, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(AxonError::Checkpoint(format!(
                "num_attention_heads ({}) is not a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(AxonError::Checkpoint(format!(
                "hidden_size ({}) is not divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(AxonError::Checkpoint(format!(
                "head dimension {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Shape of the stories15M checkpoint.
    pub fn stories15m() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 288,
            intermediate_size: 768,
            num_attention_heads: 6,
            num_key_value_heads: 6,
            num_hidden_layers: 6,
            max_position_embeddings: 256,
            weights_tied: true,
            rms_norm_eps: DEFAULT_RMS_NORM_EPS,
            rope_theta: DEFAULT_ROPE_THETA,
        }
    }

    /// Tiny test config for quick iteration.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 300,
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            num_hidden_layers: 2,
            max_position_embeddings: 32,
            weights_tied: true,
            rms_norm_eps: DEFAULT_RMS_NORM_EPS,
            rope_theta: DEFAULT_ROPE_THETA,
        }
    }
}
