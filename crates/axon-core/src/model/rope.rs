//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Adjacent dimensions `(2j, 2j + 1)` of every head
//! form one complex number rotated by `position * theta^(-2j / head_dim)`.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::Result;
use candle_core::Tensor;

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine cache: [max_seq_len, head_dim / 2]
    cos_cache: Vec<f32>,
    /// Sine cache: [max_seq_len, head_dim / 2]
    sin_cache: Vec<f32>,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (even)
    /// * `max_seq_len` - Maximum sequence length to cache
    /// * `theta` - Base frequency (10000.0 for llama2)
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f32) -> Self {
        let half_dim = head_dim / 2;
        let mut cos_cache = Vec::with_capacity(max_seq_len * half_dim);
        let mut sin_cache = Vec::with_capacity(max_seq_len * half_dim);

        for pos in 0..max_seq_len {
            for pair in 0..half_dim {
                let freq = 1.0 / theta.powf((2 * pair) as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos_cache.push(angle.cos());
                sin_cache.push(angle.sin());
            }
        }

        Self {
            cos_cache,
            sin_cache,
            head_dim,
            max_seq_len,
        }
    }

    /// Rotate every head of `x` in place for `position`.
    ///
    /// `x.len()` must be a multiple of the head dimension.
    pub fn apply(&self, x: &mut [f32], position: usize) {
        debug_assert!(position < self.max_seq_len);
        debug_assert_eq!(x.len() % self.head_dim, 0);

        let half_dim = self.head_dim / 2;
        let cos = &self.cos_cache[position * half_dim..(position + 1) * half_dim];
        let sin = &self.sin_cache[position * half_dim..(position + 1) * half_dim];

        for head in x.chunks_exact_mut(self.head_dim) {
            for (pair, (&c, &s)) in head.chunks_exact_mut(2).zip(cos.iter().zip(sin)) {
                let v0 = pair[0];
                let v1 = pair[1];
                pair[0] = v0 * c - v1 * s;
                pair[1] = v0 * s + v1 * c;
            }
        }
    }

    /// Rotate a tensor of shape [seq_len, num_heads, head_dim] whose first
    /// row sits at position `start`.
    pub fn apply_tensor(&self, x: &Tensor, start: usize) -> Result<Tensor> {
        let (seq_len, num_heads, head_dim) = x.dims3()?;
        let half_dim = head_dim / 2;
        let device = x.device();

        let range = start * half_dim..(start + seq_len) * half_dim;
        let cos = Tensor::from_slice(&self.cos_cache[range.clone()], (seq_len, 1, half_dim, 1), device)?;
        let sin = Tensor::from_slice(&self.sin_cache[range], (seq_len, 1, half_dim, 1), device)?;

        // Split interleaved pairs: [seq, heads, half, 2]
        let pairs = x.reshape((seq_len, num_heads, half_dim, 2))?;
        let x0 = pairs.narrow(3, 0, 1)?;
        let x1 = pairs.narrow(3, 1, 1)?;

        let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

        Ok(Tensor::cat(&[out0, out1], 3)?.reshape((seq_len, num_heads, head_dim))?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rope_creation() {
        let rope = RotaryEmbedding::new(64, 2048, 10000.0);
        assert_eq!(rope.head_dim(), 64);
        assert_eq!(rope.max_seq_len(), 2048);
        assert_eq!(rope.cos_cache.len(), 2048 * 32);
    }

    #[test]
    fn position_zero_is_identity() {
        let rope = RotaryEmbedding::new(8, 16, 10000.0);
        let original: Vec<f32> = (0..16).map(|i| i as f32 - 4.0).collect();
        let mut x = original.clone();
        rope.apply(&mut x, 0);
        assert_eq!(x, original);
    }

    #[test]
    fn rotation_preserves_pair_norms() {
        let rope = RotaryEmbedding::new(16, 128, 10000.0);
        let original: Vec<f32> = (0..32).map(|i| (i as f32 * 0.7).cos()).collect();
        let mut x = original.clone();
        rope.apply(&mut x, 97);

        for (a, b) in original.chunks(2).zip(x.chunks(2)) {
            let before = a[0].hypot(a[1]);
            let after = b[0].hypot(b[1]);
            assert!((before - after).abs() < 1e-5);
        }
        assert_ne!(x, original);
    }

    #[test]
    fn first_pair_rotates_by_position() {
        // Pair 0 has frequency 1, so the angle equals the position.
        let rope = RotaryEmbedding::new(4, 8, 10000.0);
        let mut x = [1.0, 0.0, 1.0, 0.0];
        rope.apply(&mut x, 3);
        assert!((x[0] - 3.0f32.cos()).abs() < 1e-6);
        assert!((x[1] - 3.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn tensor_path_matches_slice_path() {
        let rope = RotaryEmbedding::new(8, 32, 10000.0);
        let seq_len = 3;
        let heads = 2;
        let data: Vec<f32> = (0..seq_len * heads * 8).map(|i| (i as f32 * 0.31).sin()).collect();

        let tensor = Tensor::from_slice(&data, (seq_len, heads, 8), &Device::Cpu).unwrap();
        let rotated = rope.apply_tensor(&tensor, 5).unwrap();
        let rotated: Vec<f32> = rotated.flatten_all().unwrap().to_vec1().unwrap();

        for (t, row) in data.chunks(heads * 8).enumerate() {
            let mut expected = row.to_vec();
            rope.apply(&mut expected, 5 + t);
            let actual = &rotated[t * heads * 8..(t + 1) * heads * 8];
            for (a, e) in actual.iter().zip(&expected) {
                assert!((a - e).abs() < 1e-6);
            }
        }
    }
}
