//! Streaming generation through the high-level engine.
//!
//! Run with:
//! ```bash
//! cargo run --release -p axon --example generate -- stories15M.bin tokenizer.bin "Once upon a time"
//! ```

use axon::prelude::*;
use std::io::Write;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: generate <checkpoint> <tokenizer> [prompt]");
        std::process::exit(1);
    }
    let prompt = args.get(3).map(String::as_str).unwrap_or("Once upon a time");

    let engine = Engine::builder()
        .checkpoint_path(&args[1])
        .tokenizer_path(&args[2])
        .max_steps(256)
        .build()?;

    let model = engine.model_config();
    println!(
        "Model: dim={} layers={} heads={}/{} vocab={} seq_len={}",
        model.hidden_size,
        model.num_hidden_layers,
        model.num_attention_heads,
        model.num_key_value_heads,
        model.vocab_size,
        model.max_position_embeddings
    );

    println!("\n=== Greedy ===\n");
    let greedy = engine.generate(prompt).temperature(0.0).max_steps(64).execute()?;
    println!("{}", greedy.text);
    println!(
        "[{} prompt + {} generated tokens]",
        greedy.num_prompt_tokens, greedy.num_generated_tokens
    );

    println!("\n=== Streaming, t=0.8 top_p=0.9 ===\n");
    let mut stdout = std::io::stdout().lock();
    let stats = engine
        .generate(prompt)
        .temperature(0.8)
        .top_p(0.9)
        .seed(124)
        .stream(|fragment| {
            // A closed pipe ends the stream.
            stdout.write_all(&fragment.text).is_ok() && stdout.flush().is_ok()
        })?;
    println!();
    println!(
        "[{} tokens, {:.1} tok/s]",
        stats.generated_tokens,
        stats.tokens_per_second()
    );

    Ok(())
}
