//! BPE encode and decode throughput.
//!
//! Uses a synthetic vocabulary: the three control tokens, 256 byte-fallback
//! pieces, printable ASCII singles and a ladder of merges spelling common
//! English words, so encoding exercises both the merge loop and the byte
//! fallback path.

use axon_core::tokenizer::Tokenizer;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const WORDS: &[&str] = &[
    " the", " and", " was", " she", " he", " little", " day", " girl", " very", " happy",
];

fn build_vocabulary() -> Tokenizer {
    let mut entries: Vec<(Vec<u8>, f32)> = vec![
        (b"<unk>".to_vec(), 0.0),
        (b"\n<s>\n".to_vec(), 0.0),
        (b"\n</s>\n".to_vec(), 0.0),
    ];
    entries.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>").into_bytes(), 0.0)));
    entries.extend((b' '..=b'~').map(|b| (vec![b], -1000.0 - b as f32)));

    // Every prefix of every word, longer prefixes scoring higher.
    let mut score = -1.0;
    for word in WORDS {
        for end in 2..=word.len() {
            let piece = word.as_bytes()[..end].to_vec();
            if entries.iter().all(|(existing, _)| *existing != piece) {
                entries.push((piece, score));
                score -= 1.0;
            }
        }
    }

    Tokenizer::from_entries(entries).unwrap()
}

fn sample_text(words: usize) -> String {
    let mut text = String::from("Once upon a time");
    for i in 0..words {
        text.push_str(WORDS[i % WORDS.len()]);
        if i % 7 == 6 {
            text.push_str(". ü\n");
        }
    }
    text
}

/// Benchmark: encode cost as the prompt grows.
fn bench_encode(c: &mut Criterion) {
    let tokenizer = build_vocabulary();
    let mut group = c.benchmark_group("tokenizer_encode");

    for words in [8usize, 64, 256] {
        let text = sample_text(words);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("words", words), &text, |b, text| {
            b.iter(|| black_box(tokenizer.encode(black_box(text), true, false)))
        });
    }

    group.finish();
}

/// Benchmark: per-token decode, including byte pieces.
fn bench_decode(c: &mut Criterion) {
    let tokenizer = build_vocabulary();
    let tokens = tokenizer.encode(&sample_text(256), true, false);

    let mut group = c.benchmark_group("tokenizer_decode");
    group.throughput(Throughput::Elements(tokens.len() as u64));
    group.bench_function("all_tokens", |b| {
        b.iter(|| {
            let mut bytes = 0usize;
            for &token in &tokens {
                bytes += tokenizer.decode(black_box(token)).len();
            }
            black_box(bytes)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);

criterion_main!(benches);
