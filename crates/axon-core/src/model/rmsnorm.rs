//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{AxonError, Result};
use candle_core::{Device, Tensor};

/// Normalize `x` into `out` and scale by `weight`.
///
/// All three slices must have the same length.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(weight.len(), x.len());

    let mut ss = x.iter().fold(0.0f32, |acc, v| acc + v * v);
    ss /= x.len() as f32;
    ss += eps;
    let scale = 1.0 / ss.sqrt();
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = w * (scale * v);
    }
}

/// RMS Layer Normalization over tensors (cache-free reference path).
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 1 {
            return Err(AxonError::InvalidArgument(format!(
                "RMSNorm weight must be 1-D, got shape {:?}",
                dims
            )));
        }
        let hidden_size = dims[0];
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create from a gain slice.
    pub fn from_slice(weight: &[f32], eps: f64, device: &Device) -> Result<Self> {
        Self::new(Tensor::from_slice(weight, weight.len(), device)?, eps)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Mean of squares over the last dimension
        let mean_sq = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;

        // 1/sqrt(mean + eps)
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }
}
