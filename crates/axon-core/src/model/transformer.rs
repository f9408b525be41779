//! Single-token forward pass with KV cache.
//!
//! [`Transformer::forward`] takes one token at one position and returns the
//! logits over the vocabulary. Keys and values of every processed position are
//! kept in a [`KvCache`], so each call only computes the new position.

use super::checkpoint::Checkpoint;
use super::config::ModelConfig;
use super::kernels::{dot, silu, softmax, ComputeBackend};
use super::kv_cache::KvCache;
use super::rmsnorm::rmsnorm;
use super::rope::RotaryEmbedding;
use crate::error::{AxonError, Result};
use std::sync::Arc;
use tracing::debug;

/// Activation buffers reused by every forward call.
#[derive(Debug, Clone)]
struct RunState {
    /// Residual stream: [hidden]
    x: Vec<f32>,
    /// Normalized residual, then attention output: [hidden]
    xb: Vec<f32>,
    /// Projection output before the residual add: [hidden]
    xb2: Vec<f32>,
    /// Gate activations: [intermediate]
    hb: Vec<f32>,
    /// Up activations: [intermediate]
    hb2: Vec<f32>,
    /// Query: [hidden]
    q: Vec<f32>,
    /// Attention scores: [num_heads, max_seq_len]
    att: Vec<f32>,
    /// Output logits: [vocab]
    logits: Vec<f32>,
}

impl RunState {
    fn new(config: &ModelConfig) -> Self {
        let hidden = config.hidden_size;
        Self {
            x: vec![0.0; hidden],
            xb: vec![0.0; hidden],
            xb2: vec![0.0; hidden],
            hb: vec![0.0; config.intermediate_size],
            hb2: vec![0.0; config.intermediate_size],
            q: vec![0.0; hidden],
            att: vec![0.0; config.num_attention_heads * config.max_position_embeddings],
            logits: vec![0.0; config.vocab_size],
        }
    }
}

/// Decoder-only transformer evaluating one token per call.
///
/// Owns its cache and scratch; the checkpoint is shared read-only.
pub struct Transformer {
    checkpoint: Arc<Checkpoint>,
    backend: Arc<dyn ComputeBackend>,
    rope: RotaryEmbedding,
    cache: KvCache,
    state: RunState,
}

impl Transformer {
    /// Create a transformer over a loaded checkpoint.
    pub fn new(checkpoint: Arc<Checkpoint>, backend: Arc<dyn ComputeBackend>) -> Self {
        let config = checkpoint.config();
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
        );
        let cache = KvCache::new(
            config.num_hidden_layers,
            config.max_position_embeddings,
            config.num_key_value_heads,
            config.head_dim(),
        );
        let state = RunState::new(config);

        debug!(
            backend = backend.name(),
            cache_bytes = cache.bytes_per_token() * cache.capacity(),
            "transformer ready"
        );

        Self {
            checkpoint,
            backend,
            rope,
            cache,
            state,
        }
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        self.checkpoint.config()
    }

    /// The shared checkpoint.
    pub fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.checkpoint
    }

    /// Next position to process.
    pub fn position(&self) -> usize {
        self.cache.len()
    }

    /// The key/value cache.
    pub fn kv_cache(&self) -> &KvCache {
        &self.cache
    }

    /// Name of the compute backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Logits of the last forward call.
    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    /// Forget the cached sequence and start again at position 0.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Process `token` at `position` and return the logits for the next token.
    ///
    /// `position` must equal [`Transformer::position`]. Nothing is modified when
    /// an error is returned.
    pub fn forward(&mut self, token: u32, position: usize) -> Result<&[f32]> {
        self.cache.check_next(position)?;
        let config = self.checkpoint.config();
        if token as usize >= config.vocab_size {
            return Err(AxonError::InvalidToken {
                token,
                vocab_size: config.vocab_size,
            });
        }

        let Self {
            checkpoint,
            backend,
            rope,
            cache,
            state,
        } = self;
        let config = checkpoint.config();
        let weights = checkpoint.weights();
        let eps = config.rms_norm_eps;

        let head_dim = config.head_dim();
        let kv_dim = config.kv_dim();
        let gqa_ratio = config.gqa_ratio();
        let seq_stride = config.max_position_embeddings;
        let scale = (head_dim as f32).sqrt();

        let embedding = checkpoint.tensor(weights.embed_tokens);
        let hidden = config.hidden_size;
        let row = token as usize * hidden;
        state.x.copy_from_slice(&embedding[row..row + hidden]);

        for (layer, lw) in weights.layers.iter().enumerate() {
            // Attention
            rmsnorm(&mut state.xb, &state.x, checkpoint.tensor(lw.input_layernorm), eps);

            backend.matmul(&mut state.q, &state.xb, checkpoint.tensor(lw.q_proj));
            {
                let (k, v) = cache.pending_mut(layer);
                backend.matmul(k, &state.xb, checkpoint.tensor(lw.k_proj));
                backend.matmul(v, &state.xb, checkpoint.tensor(lw.v_proj));
                rope.apply(k, position);
            }
            rope.apply(&mut state.q, position);

            let keys = cache.keys(layer, position);
            let values = cache.values(layer, position);
            let q = &state.q;

            backend.for_each_head(&mut state.att, seq_stride, &|head, scores| {
                let query = &q[head * head_dim..(head + 1) * head_dim];
                let kv_offset = (head / gqa_ratio) * head_dim;
                let scores = &mut scores[..=position];
                for (t, score) in scores.iter_mut().enumerate() {
                    let start = t * kv_dim + kv_offset;
                    *score = dot(query, &keys[start..start + head_dim]) / scale;
                }
                softmax(scores);
            });

            let att = &state.att;
            backend.for_each_head(&mut state.xb, head_dim, &|head, out| {
                let probs = &att[head * seq_stride..head * seq_stride + position + 1];
                let kv_offset = (head / gqa_ratio) * head_dim;
                out.fill(0.0);
                for (t, &a) in probs.iter().enumerate() {
                    let start = t * kv_dim + kv_offset;
                    for (o, &v) in out.iter_mut().zip(&values[start..start + head_dim]) {
                        *o += a * v;
                    }
                }
            });

            backend.matmul(&mut state.xb2, &state.xb, checkpoint.tensor(lw.o_proj));
            for (x, &delta) in state.x.iter_mut().zip(&state.xb2) {
                *x += delta;
            }

            // Feed-forward
            rmsnorm(
                &mut state.xb,
                &state.x,
                checkpoint.tensor(lw.post_attention_layernorm),
                eps,
            );
            backend.matmul(&mut state.hb, &state.xb, checkpoint.tensor(lw.gate_proj));
            backend.matmul(&mut state.hb2, &state.xb, checkpoint.tensor(lw.up_proj));
            for (gate, &up) in state.hb.iter_mut().zip(&state.hb2) {
                *gate = silu(*gate) * up;
            }
            backend.matmul(&mut state.xb, &state.hb, checkpoint.tensor(lw.down_proj));
            for (x, &delta) in state.x.iter_mut().zip(&state.xb) {
                *x += delta;
            }
        }

        rmsnorm(&mut state.xb, &state.x, checkpoint.tensor(weights.norm), eps);
        backend.matmul(&mut state.logits, &state.xb, checkpoint.tensor(weights.lm_head));

        cache.commit();
        Ok(&state.logits)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", self.config())
            .field("backend", &self.backend.name())
            .field("position", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kernels::{ParallelBackend, SequentialBackend};

    fn tiny(backend: Arc<dyn ComputeBackend>) -> Transformer {
        let checkpoint = Checkpoint::random(ModelConfig::tiny(), 7).unwrap();
        Transformer::new(Arc::new(checkpoint), backend)
    }

    #[test]
    fn forward_returns_vocab_logits() {
        let mut model = tiny(Arc::new(SequentialBackend));
        let logits = model.forward(1, 0).unwrap();
        assert_eq!(logits.len(), 300);
        assert!(logits.iter().all(|v| v.is_finite()));
        assert_eq!(model.position(), 1);
    }

    #[test]
    fn cache_length_tracks_calls() {
        let mut model = tiny(Arc::new(SequentialBackend));
        for (pos, token) in [1u32, 40, 41, 299].into_iter().enumerate() {
            assert_eq!(model.kv_cache().len(), pos);
            model.forward(token, pos).unwrap();
        }
        assert_eq!(model.kv_cache().len(), 4);
    }

    #[test]
    fn backends_are_bit_identical() {
        let mut seq = tiny(Arc::new(SequentialBackend));
        let mut par = tiny(Arc::new(ParallelBackend));
        for (pos, token) in [1u32, 17, 200, 3, 3].into_iter().enumerate() {
            let a = seq.forward(token, pos).unwrap().to_vec();
            let b = par.forward(token, pos).unwrap().to_vec();
            assert_eq!(a, b, "position {pos}");
        }
    }

    #[test]
    fn rejects_skipped_position() {
        let mut model = tiny(Arc::new(SequentialBackend));
        model.forward(1, 0).unwrap();
        let err = model.forward(5, 2).unwrap_err();
        assert!(matches!(err, AxonError::Sequence { expected: 1, actual: 2 }));
        // State untouched: the right position still works.
        model.forward(5, 1).unwrap();
    }

    #[test]
    fn rejects_out_of_vocab_token() {
        let mut model = tiny(Arc::new(SequentialBackend));
        let err = model.forward(300, 0).unwrap_err();
        assert!(matches!(err, AxonError::InvalidToken { token: 300, vocab_size: 300 }));
        assert_eq!(model.position(), 0);
    }

    #[test]
    fn capacity_checked_before_token() {
        let mut model = tiny(Arc::new(SequentialBackend));
        for pos in 0..32 {
            model.forward(1, pos).unwrap();
        }
        let err = model.forward(9999, 32).unwrap_err();
        assert!(matches!(err, AxonError::Capacity { position: 32, max_seq_len: 32 }));
    }

    #[test]
    fn reset_replays_identically() {
        let mut model = tiny(Arc::new(SequentialBackend));
        let tokens = [1u32, 88, 120, 7];
        let first: Vec<Vec<f32>> = tokens
            .iter()
            .enumerate()
            .map(|(pos, &t)| model.forward(t, pos).unwrap().to_vec())
            .collect();

        model.reset();
        assert_eq!(model.position(), 0);
        for (pos, &t) in tokens.iter().enumerate() {
            assert_eq!(model.forward(t, pos).unwrap(), first[pos].as_slice());
        }
    }

    #[test]
    fn logits_depend_on_history() {
        let mut a = tiny(Arc::new(SequentialBackend));
        let mut b = tiny(Arc::new(SequentialBackend));
        a.forward(1, 0).unwrap();
        b.forward(2, 0).unwrap();
        let la = a.forward(50, 1).unwrap().to_vec();
        let lb = b.forward(50, 1).unwrap().to_vec();
        assert_ne!(la, lb);
    }

    #[test]
    fn untied_classifier_is_used() {
        let config = ModelConfig {
            weights_tied: false,
            ..ModelConfig::tiny()
        };
        let checkpoint = Arc::new(Checkpoint::random(config, 7).unwrap());
        let tied = Arc::new(Checkpoint::random(ModelConfig::tiny(), 7).unwrap());
        let mut a = Transformer::new(checkpoint, Arc::new(SequentialBackend));
        let mut b = Transformer::new(tied, Arc::new(SequentialBackend));
        assert_ne!(a.forward(1, 0).unwrap(), b.forward(1, 0).unwrap());
    }
}
