//! High-level inference engine.

use anyhow::{bail, Context, Result};
use axon_core::{
    generation::{Fragment, Generation, GenerationStats},
    model::{Checkpoint, ComputeBackend, ModelConfig, ParallelBackend, SequentialBackend, Transformer},
    sampling::{Sampler, SamplerConfig},
    tokenizer::Tokenizer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the model checkpoint.
    pub checkpoint_path: PathBuf,
    /// Path to the tokenizer vocabulary.
    pub tokenizer_path: PathBuf,
    /// Split matmuls and attention heads across the rayon pool.
    pub parallel: bool,
    /// Default step budget for requests (0: model sequence length).
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("stories15M.bin"),
            tokenizer_path: PathBuf::from("tokenizer.bin"),
            parallel: true,
            max_steps: 256,
        }
    }
}

/// Builder for creating an Engine.
#[derive(Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set checkpoint path.
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = path.into();
        self
    }

    /// Set tokenizer path.
    pub fn tokenizer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tokenizer_path = path.into();
        self
    }

    /// Use the rayon backend.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Set the default step budget.
    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = steps;
        self
    }

    /// Load the checkpoint and tokenizer.
    pub fn build(self) -> Result<Engine> {
        let checkpoint = Checkpoint::open(&self.config.checkpoint_path).with_context(|| {
            format!("loading checkpoint {}", self.config.checkpoint_path.display())
        })?;
        let vocab_size = checkpoint.config().vocab_size;
        let tokenizer = Tokenizer::from_file(&self.config.tokenizer_path, vocab_size)
            .with_context(|| {
                format!("loading tokenizer {}", self.config.tokenizer_path.display())
            })?;

        info!(
            checkpoint = %self.config.checkpoint_path.display(),
            parameters = checkpoint.num_parameters(),
            vocab_size,
            parallel = self.config.parallel,
            "engine loaded"
        );

        Engine::with_config(Arc::new(checkpoint), Arc::new(tokenizer), self.config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level inference engine.
///
/// Holds the shared checkpoint and tokenizer. Each request gets its own
/// [`Transformer`], so an engine can serve requests from several threads.
pub struct Engine {
    config: EngineConfig,
    checkpoint: Arc<Checkpoint>,
    tokenizer: Arc<Tokenizer>,
    backend: Arc<dyn ComputeBackend>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Wrap an already loaded checkpoint and tokenizer.
    pub fn from_parts(checkpoint: Arc<Checkpoint>, tokenizer: Arc<Tokenizer>) -> Result<Self> {
        let config = EngineConfig {
            parallel: false,
            ..EngineConfig::default()
        };
        Self::with_config(checkpoint, tokenizer, config)
    }

    fn with_config(
        checkpoint: Arc<Checkpoint>,
        tokenizer: Arc<Tokenizer>,
        config: EngineConfig,
    ) -> Result<Self> {
        let model_vocab = checkpoint.config().vocab_size;
        if tokenizer.vocab_size() != model_vocab {
            bail!(
                "tokenizer has {} entries but the model vocabulary has {}",
                tokenizer.vocab_size(),
                model_vocab
            );
        }
        let backend: Arc<dyn ComputeBackend> = if config.parallel {
            Arc::new(ParallelBackend)
        } else {
            Arc::new(SequentialBackend)
        };
        Ok(Self {
            config,
            checkpoint,
            tokenizer,
            backend,
        })
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model configuration.
    pub fn model_config(&self) -> &ModelConfig {
        self.checkpoint.config()
    }

    /// Get the tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// A fresh transformer over the shared weights.
    pub fn transformer(&self) -> Transformer {
        Transformer::new(self.checkpoint.clone(), self.backend.clone())
    }

    /// Generate text from a prompt.
    pub fn generate(&self, prompt: &str) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            prompt: prompt.to_string(),
            max_steps: self.config.max_steps,
            sampler: SamplerConfig::default(),
        }
    }
}

/// A generation request.
#[derive(Debug)]
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    prompt: String,
    max_steps: usize,
    sampler: SamplerConfig,
}

impl<'a> GenerateRequest<'a> {
    /// Set the step budget, prompt included (0: model sequence length).
    pub fn max_steps(mut self, n: usize) -> Self {
        self.max_steps = n;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.sampler.temperature = t;
        self
    }

    /// Set nucleus mass.
    pub fn top_p(mut self, p: f32) -> Self {
        self.sampler.top_p = p;
        self
    }

    /// Set random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampler.seed = seed;
        self
    }

    /// Run to completion and collect the output.
    pub fn execute(self) -> Result<GenerateResult> {
        let mut text = Vec::new();
        let mut tokens = Vec::new();
        let stats = self.stream(|fragment| {
            text.extend_from_slice(&fragment.text);
            tokens.push(fragment.token);
            true
        })?;

        Ok(GenerateResult {
            text: String::from_utf8_lossy(&text).into_owned(),
            tokens,
            num_prompt_tokens: stats.prompt_tokens,
            num_generated_tokens: stats.generated_tokens,
            stats,
        })
    }

    /// Deliver fragments as they are produced. Return `false` to stop early.
    pub fn stream(self, mut on_fragment: impl FnMut(&Fragment) -> bool) -> Result<GenerationStats> {
        let mut sampler = Sampler::new(&self.sampler).context("invalid sampling parameters")?;
        let mut transformer = self.engine.transformer();
        let mut generation = Generation::new(
            &mut transformer,
            &self.engine.tokenizer,
            &mut sampler,
            &self.prompt,
            self.max_steps,
        )?;

        for fragment in generation.by_ref() {
            if !on_fragment(&fragment?) {
                break;
            }
        }
        generation.finish();
        Ok(generation.stats().clone())
    }
}

/// Result of text generation.
#[derive(Debug)]
pub struct GenerateResult {
    /// Prompt echo plus generated text.
    pub text: String,
    /// Token ids after BOS, prompt included.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Timing and counters.
    pub stats: GenerationStats,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("model", self.checkpoint.config())
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vocabulary(size: usize) -> Vec<(Vec<u8>, f32)> {
        let mut entries = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
        ];
        entries.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>").into_bytes(), 0.0)));
        let words = ["a", "b", " ", " a", "ab", " ab"];
        entries.extend(words.iter().map(|w| (w.as_bytes().to_vec(), 0.0)));
        let mut i = 0;
        while entries.len() < size {
            entries.push((format!("w{i}").into_bytes(), -1.0));
            i += 1;
        }
        entries
    }

    fn tiny_engine() -> Engine {
        let checkpoint = Checkpoint::random(ModelConfig::tiny(), 21).unwrap();
        let tokenizer = Tokenizer::from_entries(vocabulary(300)).unwrap();
        Engine::from_parts(Arc::new(checkpoint), Arc::new(tokenizer)).unwrap()
    }

    #[test]
    fn execute_echoes_prompt() {
        let engine = tiny_engine();
        let result = engine
            .generate("ab a")
            .max_steps(12)
            .temperature(0.0)
            .execute()
            .unwrap();
        assert!(result.text.starts_with("ab a"));
        assert_eq!(result.num_prompt_tokens, engine.tokenizer().encode("ab a", true, false).len());
        assert!(result.tokens.len() <= 12);
    }

    #[test]
    fn seeded_requests_repeat() {
        let engine = tiny_engine();
        let run = || {
            engine
                .generate("a")
                .temperature(0.8)
                .top_p(0.95)
                .seed(124)
                .max_steps(20)
                .execute()
                .unwrap()
        };
        assert_eq!(run().tokens, run().tokens);
    }

    #[test]
    fn stream_stops_when_asked() {
        let engine = tiny_engine();
        let mut seen = 0;
        // Four prompt tokens: the first three fragments are forced.
        let stats = engine
            .generate("ab ab ab")
            .max_steps(30)
            .stream(|_| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
        assert_eq!(stats.forward_calls, 3);
    }

    #[test]
    fn rejects_bad_sampling_parameters() {
        let engine = tiny_engine();
        assert!(engine.generate("a").top_p(0.0).execute().is_err());
        assert!(engine.generate("a").temperature(-1.0).execute().is_err());
    }

    #[test]
    fn rejects_mismatched_vocabulary() {
        let checkpoint = Checkpoint::random(ModelConfig::tiny(), 1).unwrap();
        let tokenizer = Tokenizer::from_entries(vocabulary(299)).unwrap();
        let err = Engine::from_parts(Arc::new(checkpoint), Arc::new(tokenizer)).unwrap_err();
        assert!(err.to_string().contains("299"));
    }

    #[test]
    fn builder_loads_files() {
        let source = Checkpoint::random(ModelConfig::tiny(), 4).unwrap();
        let config = source.config();
        let mut model = tempfile::NamedTempFile::new().unwrap();
        let header = [
            config.hidden_size,
            config.intermediate_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.vocab_size,
            config.max_position_embeddings,
        ];
        for field in header {
            model.write_all(&(field as i32).to_ne_bytes()).unwrap();
        }
        for value in source.arena() {
            model.write_all(&value.to_ne_bytes()).unwrap();
        }

        let mut vocab = tempfile::NamedTempFile::new().unwrap();
        vocab.write_all(&16i32.to_ne_bytes()).unwrap();
        for (piece, score) in vocabulary(300) {
            vocab.write_all(&score.to_ne_bytes()).unwrap();
            vocab.write_all(&(piece.len() as i32).to_ne_bytes()).unwrap();
            vocab.write_all(&piece).unwrap();
        }

        let engine = Engine::builder()
            .checkpoint_path(model.path())
            .tokenizer_path(vocab.path())
            .parallel(true)
            .build()
            .unwrap();
        assert_eq!(engine.model_config(), source.config());
        let result = engine.generate("b").max_steps(4).execute().unwrap();
        assert!(result.text.starts_with('b'));
    }

    #[test]
    fn builder_reports_missing_checkpoint() {
        let err = Engine::builder()
            .checkpoint_path("/nonexistent/model.bin")
            .build()
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/model.bin"));
    }
}
