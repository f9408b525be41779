//! Token sampling.
//!
//! Turns a logits vector into one token id:
//! - temperature 0: argmax
//! - otherwise softmax over `logits / temperature`, then either the full
//!   distribution or the nucleus (top-p) is sampled with one uniform draw.
//!
//! The default random source is [`XorShiftRng`], whose stream is fixed by
//! the seed so runs are reproducible.

use crate::error::{AxonError, Result};
use crate::model::kernels::softmax;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

/// xorshift64* generator.
///
/// A zero state is a fixed point and yields zeros forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Generator whose state is exactly `seed`.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl RngCore for XorShiftRng {
    fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let hi = u64::from(self.next_u32());
        let lo = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for XorShiftRng {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u64::from_le_bytes(seed))
    }

    fn seed_from_u64(state: u64) -> Self {
        Self::new(state)
    }
}

/// Uniform float in `[0, 1)` from the top 24 bits of one draw.
fn uniform_f32(rng: &mut impl RngCore) -> f32 {
    (rng.next_u32() >> 8) as f32 / 16_777_216.0
}

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Softmax temperature; 0 selects greedy decoding.
    pub temperature: f32,
    /// Nucleus mass in `(0, 1]`; 1 samples the full distribution.
    pub top_p: f32,
    /// Random seed.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            seed: 42,
        }
    }
}

impl SamplerConfig {
    /// Greedy decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) || !self.temperature.is_finite() {
            return Err(AxonError::InvalidArgument(format!(
                "temperature must be a finite non-negative number, got {}",
                self.temperature
            )));
        }
        // Dividing logits by a subnormal temperature overflows to infinity.
        if self.temperature > 0.0 && !(1.0 / self.temperature).is_finite() {
            return Err(AxonError::InvalidArgument(format!(
                "temperature {} is too small, use 0 for greedy decoding",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(AxonError::InvalidArgument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Probability of one vocabulary entry during nucleus sampling.
#[derive(Debug, Clone, Copy)]
struct ProbIndex {
    prob: f32,
    index: u32,
}

/// Chooses the next token from logits.
#[derive(Debug, Clone)]
pub struct Sampler<R: RngCore = XorShiftRng> {
    temperature: f32,
    top_p: f32,
    rng: R,
    /// Scratch: probabilities.
    probs: Vec<f32>,
    /// Scratch: nucleus candidates.
    candidates: Vec<ProbIndex>,
}

impl Sampler<XorShiftRng> {
    /// Create a sampler seeded from `config.seed`.
    pub fn new(config: &SamplerConfig) -> Result<Self> {
        Self::with_rng(config, XorShiftRng::seed_from_u64(config.seed))
    }
}

impl<R: RngCore> Sampler<R> {
    /// Create a sampler over any random source. `config.seed` is ignored.
    pub fn with_rng(config: &SamplerConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            temperature: config.temperature,
            top_p: config.top_p,
            rng,
            probs: Vec::new(),
            candidates: Vec::new(),
        })
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Nucleus mass.
    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Pick a token id. `logits` must not be empty.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        debug_assert!(!logits.is_empty());
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        self.probs.clear();
        let temperature = self.temperature;
        self.probs
            .extend(logits.iter().map(|&logit| logit / temperature));
        softmax(&mut self.probs);

        let coin = uniform_f32(&mut self.rng);
        if self.top_p >= 1.0 {
            sample_mult(&self.probs, coin)
        } else {
            self.sample_top_p(coin)
        }
    }

    fn sample_top_p(&mut self, coin: f32) -> u32 {
        let n = self.probs.len();
        if n == 1 {
            return 0;
        }

        // Anything below this cannot be part of the nucleus.
        let cutoff = (1.0 - self.top_p) / (n - 1) as f32;
        self.candidates.clear();
        self.candidates.extend(
            self.probs
                .iter()
                .enumerate()
                .filter(|(_, &prob)| prob >= cutoff)
                .map(|(index, &prob)| ProbIndex {
                    prob,
                    index: index as u32,
                }),
        );
        if self.candidates.is_empty() {
            return argmax(&self.probs);
        }
        self.candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));

        let mut cumulative = 0.0f32;
        let mut last = self.candidates.len() - 1;
        for (i, candidate) in self.candidates.iter().enumerate() {
            cumulative += candidate.prob;
            if cumulative >= self.top_p {
                last = i;
                break;
            }
        }

        let nucleus = &self.candidates[..=last];
        let r = coin * cumulative;
        let mut cdf = 0.0f32;
        for candidate in nucleus {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }
        nucleus[last].index
    }
}

/// Index of the largest value, lowest index on ties.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &value) in values.iter().enumerate().skip(1) {
        if value > values[best] {
            best = i;
        }
    }
    best as u32
}

/// Inverse-CDF sample from a normalized distribution.
fn sample_mult(probs: &[f32], coin: f32) -> u32 {
    let mut cdf = 0.0f32;
    for (i, &prob) in probs.iter().enumerate() {
        cdf += prob;
        if coin < cdf {
            return i as u32;
        }
    }
    probs.len() as u32 - 1
}
