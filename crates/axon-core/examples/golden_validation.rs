//! Golden transcript validation against llama2.c.
//!
//! Replays fixed-seed generations whose output was recorded from the C
//! reference runtime and compares the bytes exactly.
//!
//! Prerequisites: `stories15M.bin`, `stories110M.bin` and `tokenizer.bin` in
//! one directory. Missing checkpoints are skipped.
//!
//! Run with:
//! ```bash
//! cargo run --release -p axon-core --example golden_validation -- /path/to/models [cases.json]
//! ```

use axon_core::generation::Generation;
use axon_core::model::{Checkpoint, ParallelBackend, Transformer};
use axon_core::sampling::{Sampler, SamplerConfig};
use axon_core::tokenizer::Tokenizer;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// One recorded generation.
#[derive(Debug, Deserialize)]
struct GoldenCase {
    checkpoint: String,
    prompt: String,
    temperature: f32,
    top_p: f32,
    steps: usize,
    #[serde(default = "default_seed")]
    seed: u64,
    expected: String,
}

fn default_seed() -> u64 {
    124
}

fn builtin_cases() -> Vec<GoldenCase> {
    let case = |checkpoint: &str, prompt: &str, temperature, steps, top_p, expected: &str| GoldenCase {
        checkpoint: checkpoint.to_string(),
        prompt: prompt.to_string(),
        temperature,
        top_p,
        steps,
        seed: default_seed(),
        expected: expected.to_string(),
    };

    vec![
        case(
            "stories15M.bin",
            "That was the darkest day of the year.",
            0.7,
            100,
            0.9,
            "That was the darkest day of the year. The stars were shining bright in the sky and the birds were singing.\n\
\"Mommy, why is it so dark?\" asked the little girl, pointing out her finger.\n\
\"Well, the sun is setting and it will be a beautiful night,\" replied her mom.\n\
The little girl looked up at the sky and smiled. \"I like it when the sun sets,\" she said.\n\
\"I know, sweetie. The",
        ),
        case(
            "stories110M.bin",
            "It was dark and cold around.",
            0.3,
            103,
            0.6,
            "It was dark and cold around. The little girl was feeling scared. She looked around and saw a big, dark room. She wanted to go in, but she was too scared.\n\
Suddenly, she heard a noise. It was coming from the corner of the room. She slowly walked over and saw a big, black cat. It was meowing and seemed to be trying to get her attention.\n\
The little girl was still scared, but she was also curious. She",
        ),
        case(
            "stories110M.bin",
            "There was a boy, who",
            0.7,
            200,
            0.9,
            "There was a boy, who was three years old. He loved to play in the park. One day, he saw a fountain in the park and he wanted to play in it. He was very excited and he started running towards the fountain. But when he got close, he slipped and fell into the fountain. He was so embarrassed. \n\
The boy started crying and he felt very sad. He wanted to get out of the fountain, but he couldn't. He started to cry even louder. \n\
Suddenly, a kind old man came to the fountain and he helped the boy out of the fountain. He was very kind and he gave the boy a hug. The boy was very happy and he thanked the old man. \n\
The boy was very embarrassed, but he was also very happy. He learned that it was important to be careful when playing in",
        ),
        case(
            "stories110M.bin",
            "It was cold and it rained.",
            0.75,
            200,
            0.8,
            "It was cold and it rained. The sky was grey and the trees were wet.\n\
Mommy and Daddy were busy in the kitchen. They were getting ready to make dinner. They put on their coats and hats.\n\
Then they heard a loud noise outside. It was thunder! It was so loud that it made them jump.\n\
Mommy and Daddy opened the window and saw a big, dark cloud. They were scared, so they decided to stay inside.\n\
Mommy and Daddy started to make dinner. They put some food on the table and started to eat. But then the thunder came again. It was so loud that it made the lights go out.\n\
Mommy and Daddy were scared and tried to hide. But it was too late. The thunder was too loud and it made the lights go out.\n\
The thunder was so strong that it made a big storm. It was so bad",
        ),
        case(
            "stories110M.bin",
            "While you sleep, i`m destroying this world.",
            0.2,
            100,
            0.9,
            "While you sleep, i`m destroying this world. She was so angry and frustrated that she couldn't stop. She was so angry that she started to cry.\n\
Suddenly, she heard a voice. It was coming from outside her window. It was a little bird.\n\
\"Why are you so angry,Anyie?\" asked the bird.\n\
\"I want to destroy this world,\" saidAnyie.\n\
The bird smiled. \"You can't",
        ),
    ]
}

fn run_case(model_dir: &Path, tokenizer: &Tokenizer, case: &GoldenCase) -> anyhow::Result<String> {
    let checkpoint = Arc::new(Checkpoint::open(model_dir.join(&case.checkpoint))?);
    let mut transformer = Transformer::new(checkpoint, Arc::new(ParallelBackend));
    let mut sampler = Sampler::new(&SamplerConfig {
        temperature: case.temperature,
        top_p: case.top_p,
        seed: case.seed,
    })?;

    let mut output = Vec::new();
    for fragment in Generation::new(
        &mut transformer,
        tokenizer,
        &mut sampler,
        &case.prompt,
        case.steps,
    )? {
        output.extend_from_slice(&fragment?.text);
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: golden_validation <model_dir> [cases.json]");
        std::process::exit(1);
    }
    let model_dir = Path::new(&args[1]);
    let cases = match args.get(2) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => builtin_cases(),
    };

    println!("Golden Validation");
    println!("=================\n");

    let mut tokenizer: Option<Tokenizer> = None;
    let (mut passed, mut failed, mut skipped) = (0, 0, 0);

    for case in &cases {
        if !model_dir.join(&case.checkpoint).exists() {
            println!("SKIP {} ({:?}): checkpoint not found", case.checkpoint, case.prompt);
            skipped += 1;
            continue;
        }
        if tokenizer.is_none() {
            let vocab_size = Checkpoint::open(model_dir.join(&case.checkpoint))?
                .config()
                .vocab_size;
            tokenizer = Some(Tokenizer::from_file(model_dir.join("tokenizer.bin"), vocab_size)?);
        }
        let Some(tokenizer) = tokenizer.as_ref() else {
            continue;
        };

        let start = Instant::now();
        let output = run_case(model_dir, tokenizer, case)?;
        let elapsed = start.elapsed().as_secs_f64();

        if output == case.expected {
            println!("PASS {} ({:?}) in {:.2}s", case.checkpoint, case.prompt, elapsed);
            passed += 1;
        } else {
            println!("FAIL {} ({:?})", case.checkpoint, case.prompt);
            println!("  expected: {:?}", case.expected);
            println!("  actual:   {:?}", output);
            failed += 1;
        }
    }

    println!("\n{passed} passed, {failed} failed, {skipped} skipped");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
