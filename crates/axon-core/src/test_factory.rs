//! Fixtures shared by unit tests.

use crate::model::{Checkpoint, HEADER_LEN};
use crate::tokenizer::Tokenizer;

/// Serialize a checkpoint into the on-disk layout.
pub(crate) fn checkpoint_image(checkpoint: &Checkpoint) -> Vec<u8> {
    let config = checkpoint.config();
    let vocab = if config.weights_tied {
        config.vocab_size as i32
    } else {
        -(config.vocab_size as i32)
    };
    let header = [
        config.hidden_size as i32,
        config.intermediate_size as i32,
        config.num_hidden_layers as i32,
        config.num_attention_heads as i32,
        config.num_key_value_heads as i32,
        vocab,
        config.max_position_embeddings as i32,
    ];

    let arena = checkpoint.arena();
    let mut image = Vec::with_capacity(HEADER_LEN + arena.len() * 4);
    for field in header {
        image.extend_from_slice(&field.to_ne_bytes());
    }
    for value in arena {
        image.extend_from_slice(&value.to_ne_bytes());
    }
    image
}

/// Serialize a tokenizer into the vocabulary file layout.
pub(crate) fn vocab_image(tokenizer: &Tokenizer, max_token_length: i32) -> Vec<u8> {
    let mut image = max_token_length.to_ne_bytes().to_vec();
    for id in 0..tokenizer.vocab_size() as u32 {
        let piece = tokenizer.piece(id);
        image.extend_from_slice(&tokenizer.score(id).unwrap_or(0.0).to_ne_bytes());
        image.extend_from_slice(&(piece.len() as i32).to_ne_bytes());
        image.extend_from_slice(piece);
    }
    image
}

/// Special tokens followed by the 256 byte fallback pieces.
pub(crate) fn base_entries() -> Vec<(Vec<u8>, f32)> {
    let mut entries = vec![
        (b"<unk>".to_vec(), 0.0),
        (b"<s>".to_vec(), 0.0),
        (b"</s>".to_vec(), 0.0),
    ];
    entries.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>").into_bytes(), 0.0)));
    entries
}

/// A 300-entry vocabulary matching `ModelConfig::tiny()`.
///
/// Knows a handful of letters and merges that spell " the" and " hello".
pub(crate) fn sample_tokenizer() -> Tokenizer {
    const CHARS: [&str; 13] = [" ", "e", "h", "l", "o", "t", "a", "n", "d", "r", "s", "i", "w"];
    const MERGES: [&str; 28] = [
        "he", "ll", "hell", "hello", " hello", " t", "th", "the", " the", " h", "an", "and",
        " and", " a", "er", "in", "re", "on", "at", "st", "wh", "it", "is", " w", "ed", "nd",
        "es", "or",
    ];

    let mut entries = base_entries();
    for (i, piece) in CHARS.iter().enumerate() {
        entries.push((piece.as_bytes().to_vec(), -100.0 - i as f32));
    }
    // Earlier merges score higher.
    for (i, piece) in MERGES.iter().enumerate() {
        entries.push((piece.as_bytes().to_vec(), -1.0 - i as f32));
    }
    debug_assert_eq!(entries.len(), 300);

    Tokenizer::from_entries(entries).expect("sample vocabulary is valid")
}
