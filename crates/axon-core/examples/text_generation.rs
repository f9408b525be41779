//! Text generation from a llama2 checkpoint.
//!
//! Streams the prompt echo and the sampled continuation to stdout and reports
//! throughput on stderr.
//!
//! Run with:
//! ```bash
//! cargo run --release -p axon-core --example text_generation -- stories15M.bin \
//!     -z tokenizer.bin -t 0.7 -p 0.9 -s 124 -n 100 -i "Once upon a time"
//! ```
//!
//! Set `RUST_LOG=debug` to see loader and generation events.

use axon_core::generation::Generation;
use axon_core::model::{Checkpoint, ComputeBackend, ParallelBackend, SequentialBackend, Transformer};
use axon_core::sampling::{Sampler, SamplerConfig};
use axon_core::tokenizer::Tokenizer;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

struct Args {
    checkpoint: String,
    tokenizer: String,
    sampler: SamplerConfig,
    steps: usize,
    prompt: String,
    sequential: bool,
}

fn usage() -> ! {
    eprintln!("Usage: text_generation <checkpoint> [options]");
    eprintln!("  -t <float>  temperature in [0, inf), default 1.0");
    eprintln!("  -p <float>  top-p in (0, 1], default 0.9");
    eprintln!("  -s <int>    random seed, default time based");
    eprintln!("  -n <int>    steps to run, 0 = max sequence length, default 256");
    eprintln!("  -i <string> prompt");
    eprintln!("  -z <path>   tokenizer, default tokenizer.bin");
    eprintln!("  --sequential  single-threaded backend");
    std::process::exit(1);
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let Some(checkpoint) = args.next() else { usage() };

    let seed = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut parsed = Args {
        checkpoint,
        tokenizer: "tokenizer.bin".to_string(),
        sampler: SamplerConfig {
            temperature: 1.0,
            top_p: 0.9,
            seed,
        },
        steps: 256,
        prompt: String::new(),
        sequential: false,
    };

    while let Some(flag) = args.next() {
        if flag == "--sequential" {
            parsed.sequential = true;
            continue;
        }
        let Some(value) = args.next() else { usage() };
        match flag.as_str() {
            "-t" => parsed.sampler.temperature = value.parse()?,
            "-p" => parsed.sampler.top_p = value.parse()?,
            "-s" => parsed.sampler.seed = value.parse()?,
            "-n" => parsed.steps = value.parse()?,
            "-i" => parsed.prompt = value,
            "-z" => parsed.tokenizer = value,
            _ => usage(),
        }
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = parse_args()?;

    let checkpoint = Arc::new(Checkpoint::open(&args.checkpoint)?);
    let tokenizer = Tokenizer::from_file(&args.tokenizer, checkpoint.config().vocab_size)?;
    let backend: Arc<dyn ComputeBackend> = if args.sequential {
        Arc::new(SequentialBackend)
    } else {
        Arc::new(ParallelBackend)
    };
    let mut transformer = Transformer::new(checkpoint, backend);
    let mut sampler = Sampler::new(&args.sampler)?;

    let mut generation = Generation::new(
        &mut transformer,
        &tokenizer,
        &mut sampler,
        &args.prompt,
        args.steps,
    )?;

    let mut stdout = io::stdout().lock();
    for fragment in &mut generation {
        stdout.write_all(&fragment?.text)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    let stats = generation.stats();
    if stats.forward_calls > 1 {
        eprintln!("achieved tok/s: {:.2}", stats.tokens_per_second());
    }
    Ok(())
}
