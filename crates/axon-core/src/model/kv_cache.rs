//! KV cache for incremental decoding.
//!
//! Keys and values live in two flat buffers laid out as
//! `[num_layers, max_seq_len, num_kv_heads * head_dim]`. A forward call at
//! position `p` writes slot `p` of every layer exactly once and then commits
//! it; committed slots are read-only for the rest of the sequence.

use crate::error::{AxonError, Result};

/// Preallocated per-layer, per-position key/value storage.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Cached keys: [num_layers, max_seq_len, kv_dim]
    keys: Vec<f32>,
    /// Cached values: [num_layers, max_seq_len, kv_dim]
    values: Vec<f32>,
    num_layers: usize,
    max_seq_len: usize,
    kv_dim: usize,
    /// Number of committed positions.
    len: usize,
}

impl KvCache {
    /// Allocate a zeroed cache.
    pub fn new(num_layers: usize, max_seq_len: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let kv_dim = num_kv_heads * head_dim;
        let size = num_layers * max_seq_len * kv_dim;
        Self {
            keys: vec![0.0; size],
            values: vec![0.0; size],
            num_layers,
            max_seq_len,
            kv_dim,
            len: 0,
        }
    }

    /// Number of positions written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of positions.
    pub fn capacity(&self) -> usize {
        self.max_seq_len
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Width of one cached key or value row.
    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Check that `position` is the next slot to fill.
    pub fn check_next(&self, position: usize) -> Result<()> {
        if position >= self.max_seq_len {
            return Err(AxonError::Capacity {
                position,
                max_seq_len: self.max_seq_len,
            });
        }
        if position != self.len {
            return Err(AxonError::Sequence {
                expected: self.len,
                actual: position,
            });
        }
        Ok(())
    }

    fn slot(&self, layer: usize, position: usize) -> std::ops::Range<usize> {
        let start = (layer * self.max_seq_len + position) * self.kv_dim;
        start..start + self.kv_dim
    }

    /// Mutable key and value rows for the uncommitted slot of `layer`.
    pub fn pending_mut(&mut self, layer: usize) -> (&mut [f32], &mut [f32]) {
        debug_assert!(self.len < self.max_seq_len);
        let range = self.slot(layer, self.len);
        (&mut self.keys[range.clone()], &mut self.values[range])
    }

    /// Keys of `layer` for positions `0..=position`, including the pending slot.
    pub fn keys(&self, layer: usize, position: usize) -> &[f32] {
        debug_assert!(position <= self.len);
        let start = self.slot(layer, 0).start;
        &self.keys[start..start + (position + 1) * self.kv_dim]
    }

    /// Values of `layer` for positions `0..=position`, including the pending slot.
    pub fn values(&self, layer: usize, position: usize) -> &[f32] {
        debug_assert!(position <= self.len);
        let start = self.slot(layer, 0).start;
        &self.values[start..start + (position + 1) * self.kv_dim]
    }

    /// Mark the pending slot as written in every layer.
    pub fn commit(&mut self) {
        debug_assert!(self.len < self.max_seq_len);
        self.len += 1;
    }

    /// Start a new sequence. Old contents are overwritten as positions refill.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Bytes per token for this cache.
    pub fn bytes_per_token(&self) -> usize {
        // 2 (K+V) * layers * kv_dim * sizeof(f32)
        2 * self.num_layers * self.kv_dim * std::mem::size_of::<f32>()
    }
}
