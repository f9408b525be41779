//! Autoregressive generation.
//!
//! [`Generation`] encodes a prompt, replays it through the transformer to
//! fill the KV cache, then samples one token per step. Every step yields a
//! [`Fragment`] with the bytes to print, so output can be streamed.
//!
//! # Example
//!
//! ```ignore
//! let mut generation = Generation::new(&mut transformer, &tokenizer, &mut sampler, "Once", 64)?;
//! for fragment in &mut generation {
//!     std::io::stdout().write_all(&fragment?.text)?;
//! }
//! println!("{:.1} tok/s", generation.stats().tokens_per_second());
//! ```

use crate::error::{AxonError, Result};
use crate::model::Transformer;
use crate::sampling::{Sampler, XorShiftRng};
use crate::tokenizer::{Tokenizer, BOS_TOKEN_ID, EOS_TOKEN_ID};
use rand::RngCore;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Where a fragment's token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FragmentSource {
    /// Forced from the prompt during prefill.
    Prompt,
    /// Chosen by the sampler.
    Sampled,
}

/// One step of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Token fed to the next step.
    pub token: u32,
    /// Sequence position of `token`.
    pub position: usize,
    /// Bytes to print; may be empty.
    pub text: Vec<u8>,
    /// Prompt or sampled.
    pub source: FragmentSource,
}

/// Counters for one generation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    /// Prompt length in tokens, BOS included.
    pub prompt_tokens: usize,
    /// Tokens chosen by the sampler.
    pub generated_tokens: usize,
    /// Forward calls made.
    pub forward_calls: usize,
    /// Wall time from the first forward call to the last.
    pub elapsed: Duration,
    /// Wall time after the first forward call.
    #[serde(skip)]
    timed: Duration,
}

impl GenerationStats {
    /// Throughput, excluding the first forward call.
    pub fn tokens_per_second(&self) -> f64 {
        let seconds = self.timed.as_secs_f64();
        if self.forward_calls < 2 || seconds == 0.0 {
            return 0.0;
        }
        (self.forward_calls - 1) as f64 / seconds
    }
}

/// Streaming generation over one prompt.
pub struct Generation<'a, R: RngCore = XorShiftRng> {
    transformer: &'a mut Transformer,
    tokenizer: &'a Tokenizer,
    sampler: &'a mut Sampler<R>,
    prompt: Vec<u32>,
    token: u32,
    position: usize,
    max_steps: usize,
    finished: bool,
    stats: GenerationStats,
    started: Option<Instant>,
    first_step_done: Option<Instant>,
}

impl<'a, R: RngCore> Generation<'a, R> {
    /// Encode `prompt` and prepare to generate.
    ///
    /// `max_steps` counts forward calls including the prompt. Zero or anything
    /// above the model's sequence length means the sequence length. The
    /// transformer is reset.
    pub fn new(
        transformer: &'a mut Transformer,
        tokenizer: &'a Tokenizer,
        sampler: &'a mut Sampler<R>,
        prompt: &str,
        max_steps: usize,
    ) -> Result<Self> {
        let seq_len = transformer.config().max_position_embeddings;
        let max_steps = if max_steps == 0 || max_steps > seq_len {
            seq_len
        } else {
            max_steps
        };

        let prompt = tokenizer.encode(prompt, true, false);
        let vocab_size = transformer.config().vocab_size;
        if let Some(&token) = prompt.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(AxonError::InvalidToken { token, vocab_size });
        }

        transformer.reset();
        let token = prompt[0];
        let stats = GenerationStats {
            prompt_tokens: prompt.len(),
            ..GenerationStats::default()
        };

        Ok(Self {
            transformer,
            tokenizer,
            sampler,
            prompt,
            token,
            position: 0,
            max_steps,
            finished: false,
            stats,
            started: None,
            first_step_done: None,
        })
    }

    /// Prompt tokens, BOS included.
    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt
    }

    /// Effective step budget.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Counters so far.
    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// End the run and log its summary.
    ///
    /// Called automatically when the iterator is exhausted. Callers that stop
    /// early call it themselves. Later calls do nothing and the iterator
    /// yields no more fragments.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!(
            prompt_tokens = self.stats.prompt_tokens,
            generated_tokens = self.stats.generated_tokens,
            forward_calls = self.stats.forward_calls,
            elapsed_ms = self.stats.elapsed.as_millis() as u64,
            tokens_per_second = self.stats.tokens_per_second(),
            "generation finished"
        );
    }

    fn step(&mut self) -> Result<Option<Fragment>> {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);

        let logits = self.transformer.forward(self.token, self.position)?;
        let (next, source) = if self.position + 1 < self.prompt.len() {
            (self.prompt[self.position + 1], FragmentSource::Prompt)
        } else {
            (self.sampler.sample(logits), FragmentSource::Sampled)
        };
        self.position += 1;

        let now = Instant::now();
        self.stats.forward_calls += 1;
        self.stats.elapsed = now - started;
        match self.first_step_done {
            Some(first) => self.stats.timed = now - first,
            None => self.first_step_done = Some(now),
        }

        if source == FragmentSource::Sampled {
            if next == BOS_TOKEN_ID || next == EOS_TOKEN_ID {
                return Ok(None);
            }
            self.stats.generated_tokens += 1;
        }

        let text = printable_piece(self.tokenizer, self.token, next).to_vec();
        self.token = next;
        Ok(Some(Fragment {
            token: next,
            position: self.position,
            text,
            source,
        }))
    }
}

impl<R: RngCore> Iterator for Generation<'_, R> {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.position >= self.max_steps {
            self.finish();
            return None;
        }

        match self.step() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(AxonError::Capacity {
                position,
                max_seq_len,
            }) => {
                warn!(position, max_seq_len, "sequence length exhausted");
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

/// Bytes to print for `next` when it follows `previous`.
///
/// Drops the leading space of the first piece after BOS and suppresses
/// single bytes that are neither printable nor whitespace.
pub fn printable_piece(tokenizer: &Tokenizer, previous: u32, next: u32) -> &[u8] {
    let mut piece = tokenizer.decode(next);
    if previous == BOS_TOKEN_ID {
        if let [b' ', rest @ ..] = piece {
            piece = rest;
        }
    }
    match piece {
        [byte] if !is_printable(*byte) => &[],
        _ => piece,
    }
}

fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7E | b'\t' | b'\n' | 0x0B | 0x0C | b'\r')
}
