//! Cache-free forward pass on candle tensors.
//!
//! Evaluates a whole token sequence at once with an explicit causal mask.
//! Slower than [`Transformer`](super::Transformer) but independent of the KV
//! cache, which makes it the oracle for cached decoding.

use super::checkpoint::{Checkpoint, TensorView};
use super::config::ModelConfig;
use super::rmsnorm::RmsNorm;
use super::rope::RotaryEmbedding;
use crate::error::{AxonError, Result};
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear};

/// One decoder layer as candle modules.
#[derive(Debug, Clone)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    post_attention_layernorm: RmsNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

/// Whole-sequence transformer without a KV cache.
#[derive(Debug, Clone)]
pub struct ReferenceTransformer {
    config: ModelConfig,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    device: Device,
}

impl ReferenceTransformer {
    /// Copy the checkpoint weights into CPU tensors.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self> {
        let config = checkpoint.config().clone();
        let device = Device::Cpu;
        let weights = checkpoint.weights();
        let eps = f64::from(config.rms_norm_eps);

        let matrix = |view: TensorView| -> Result<Tensor> {
            Ok(Tensor::from_slice(
                checkpoint.tensor(view),
                (view.rows(), view.cols()),
                &device,
            )?)
        };
        let linear = |view: TensorView| -> Result<Linear> { Ok(Linear::new(matrix(view)?, None)) };
        let norm = |view: TensorView| RmsNorm::from_slice(checkpoint.tensor(view), eps, &device);

        let layers = weights
            .layers
            .iter()
            .map(|lw| {
                Ok(DecoderLayer {
                    input_layernorm: norm(lw.input_layernorm)?,
                    q_proj: linear(lw.q_proj)?,
                    k_proj: linear(lw.k_proj)?,
                    v_proj: linear(lw.v_proj)?,
                    o_proj: linear(lw.o_proj)?,
                    post_attention_layernorm: norm(lw.post_attention_layernorm)?,
                    gate_proj: linear(lw.gate_proj)?,
                    up_proj: linear(lw.up_proj)?,
                    down_proj: linear(lw.down_proj)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let embed_tokens = Embedding::new(matrix(weights.embed_tokens)?, config.hidden_size);
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm: norm(weights.norm)?,
            lm_head: linear(weights.lm_head)?,
            rope,
            config,
            device,
        })
    }

    /// Logits for every position of `tokens`, starting at position 0.
    pub fn forward_sequence(&self, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        let seq_len = tokens.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }
        if seq_len > self.config.max_position_embeddings {
            return Err(AxonError::Capacity {
                position: seq_len - 1,
                max_seq_len: self.config.max_position_embeddings,
            });
        }
        if let Some(&token) = tokens.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            return Err(AxonError::InvalidToken {
                token,
                vocab_size: self.config.vocab_size,
            });
        }

        let ids = Tensor::new(tokens, &self.device)?;
        let mask = self.causal_mask(seq_len)?;

        // [seq, hidden]
        let mut hidden_states = self.embed_tokens.forward(&ids)?;
        for layer in &self.layers {
            hidden_states = self.layer_forward(layer, &hidden_states, &mask)?;
        }

        let normed = self.norm.forward(&hidden_states)?;
        Ok(self.lm_head.forward(&normed)?.to_vec2()?)
    }

    fn layer_forward(&self, layer: &DecoderLayer, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let seq_len = x.dims()[0];
        let num_heads = self.config.num_attention_heads;
        let num_kv_heads = self.config.num_key_value_heads;
        let head_dim = self.config.head_dim();

        let normed = layer.input_layernorm.forward(x)?;
        let q = layer.q_proj.forward(&normed)?.reshape((seq_len, num_heads, head_dim))?;
        let k = layer.k_proj.forward(&normed)?.reshape((seq_len, num_kv_heads, head_dim))?;
        let v = layer.v_proj.forward(&normed)?.reshape((seq_len, num_kv_heads, head_dim))?;

        let q = self.rope.apply_tensor(&q, 0)?;
        let k = self.rope.apply_tensor(&k, 0)?;

        // [heads, seq, head_dim]
        let q = q.transpose(0, 1)?.contiguous()?;
        let k = repeat_kv(&k.transpose(0, 1)?, num_heads / num_kv_heads)?;
        let v = repeat_kv(&v.transpose(0, 1)?, num_heads / num_kv_heads)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = weights
            .matmul(&v)?
            .transpose(0, 1)?
            .reshape((seq_len, num_heads * head_dim))?;

        let x = (x + layer.o_proj.forward(&attn)?)?;

        let normed = layer.post_attention_layernorm.forward(&x)?;
        let gate = candle_nn::ops::silu(&layer.gate_proj.forward(&normed)?)?;
        let up = layer.up_proj.forward(&normed)?;
        let mlp = layer.down_proj.forward(&(gate * up)?)?;

        Ok((x + mlp)?)
    }

    /// Additive mask: 0 on and below the diagonal, -inf above.
    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_slice(&mask, (seq_len, seq_len), &self.device)?)
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// Repeat KV heads for GQA: [kv_heads, seq, d] -> [kv_heads * repeat, seq, d].
fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.contiguous()?);
    }
    let (num_kv_heads, seq_len, head_dim) = x.dims3()?;
    Ok(x.unsqueeze(1)?
        .expand((num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((num_kv_heads * repeat, seq_len, head_dim))?)
}
