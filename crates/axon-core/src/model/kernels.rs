//! Compute kernels for the single-token forward pass.
//!
//! Provides:
//! - [`ComputeBackend`] - Trait for matrix-vector and per-head dispatch
//! - [`SequentialBackend`] - Plain scalar loops
//! - [`ParallelBackend`] - Rayon work splitting over rows and heads
//!
//! Both backends evaluate every output element with the same operation
//! order, so their results are bit-identical.

use rayon::prelude::*;
use std::fmt::Debug;

/// Backend for the data-parallel parts of a forward call.
pub trait ComputeBackend: Send + Sync + Debug {
    /// `out = W · x` where `W` is row-major `[out.len(), x.len()]`.
    fn matmul(&self, out: &mut [f32], x: &[f32], w: &[f32]);

    /// Run `f(head, chunk)` for every `chunk_len`-sized chunk of `out`.
    fn for_each_head(
        &self,
        out: &mut [f32],
        chunk_len: usize,
        f: &(dyn Fn(usize, &mut [f32]) + Sync),
    );

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Single-threaded reference backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialBackend;

impl ComputeBackend for SequentialBackend {
    fn matmul(&self, out: &mut [f32], x: &[f32], w: &[f32]) {
        debug_assert_eq!(w.len(), out.len() * x.len());
        for (row, value) in w.chunks_exact(x.len()).zip(out.iter_mut()) {
            *value = dot(row, x);
        }
    }

    fn for_each_head(
        &self,
        out: &mut [f32],
        chunk_len: usize,
        f: &(dyn Fn(usize, &mut [f32]) + Sync),
    ) {
        for (head, chunk) in out.chunks_mut(chunk_len).enumerate() {
            f(head, chunk);
        }
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// Rayon-backed backend splitting rows and heads across the global pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelBackend;

impl ComputeBackend for ParallelBackend {
    fn matmul(&self, out: &mut [f32], x: &[f32], w: &[f32]) {
        debug_assert_eq!(w.len(), out.len() * x.len());
        out.par_iter_mut()
            .zip(w.par_chunks_exact(x.len()))
            .for_each(|(value, row)| *value = dot(row, x));
    }

    fn for_each_head(
        &self,
        out: &mut [f32],
        chunk_len: usize,
        f: &(dyn Fn(usize, &mut [f32]) + Sync),
    ) {
        out.par_chunks_mut(chunk_len)
            .enumerate()
            .for_each(|(head, chunk)| f(head, chunk));
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

/// Dot product accumulated left to right.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| acc + x * y)
}

/// In-place numerically stable softmax.
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for value in x.iter_mut() {
        *value = (*value - max).exp();
        sum += *value;
    }
    for value in x.iter_mut() {
        *value /= sum;
    }
}

/// SiLU activation: `x * sigmoid(x)`.
#[inline]
pub fn silu(x: f32) -> f32 {
    x * (1.0 / (1.0 + (-x).exp()))
}
