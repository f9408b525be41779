//! Byte-pair tokenizer for text-to-token and token-to-text conversion.
//!
//! The vocabulary is an ordered list of `(piece, score)` pairs. Encoding seeds
//! one token per UTF-8 code point (falling back to one token per byte) and then
//! greedily merges the adjacent pair with the highest score until no pair
//! forms a known piece.
//!
//! # Vocabulary file
//!
//! `i32 max_token_length`, then for every token `f32 score`, `i32 len` and
//! `len` bytes, all native-endian.

use crate::error::{AxonError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Unknown token id.
pub const UNK_TOKEN_ID: u32 = 0;
/// Beginning-of-sequence token id.
pub const BOS_TOKEN_ID: u32 = 1;
/// End-of-sequence token id.
pub const EOS_TOKEN_ID: u32 = 2;
/// Id of the byte fallback token for byte `0x00`.
pub const BYTE_FALLBACK_OFFSET: u32 = 3;

static BYTES: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    table
};

/// BPE tokenizer backed by an in-memory vocabulary.
#[derive(Clone)]
pub struct Tokenizer {
    /// Piece bytes by id.
    pieces: Vec<Vec<u8>>,
    /// Merge score by id.
    scores: Vec<f32>,
    /// Raw byte for `<0xHH>` pieces.
    raw_bytes: Vec<Option<u8>>,
    /// Piece to id, first id wins.
    lookup: HashMap<Vec<u8>, u32>,
    max_token_length: usize,
}

impl Tokenizer {
    /// Load a vocabulary file holding exactly `vocab_size` entries.
    pub fn from_file(path: impl AsRef<Path>, vocab_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AxonError::Vocabulary(format!("failed to open {}: {}", path.display(), e))
        })?;
        let tokenizer = Self::from_reader(BufReader::new(file), vocab_size)?;
        debug!(
            path = %path.display(),
            vocab_size,
            max_token_length = tokenizer.max_token_length,
            "loaded vocabulary"
        );
        Ok(tokenizer)
    }

    /// Read a vocabulary of `vocab_size` entries from any reader.
    pub fn from_reader(mut reader: impl Read, vocab_size: usize) -> Result<Self> {
        let max_token_length = read_i32(&mut reader, "max_token_length")?;
        if max_token_length < 0 {
            return Err(AxonError::Vocabulary(format!(
                "max_token_length must be non-negative, found {max_token_length}"
            )));
        }
        let max_token_length = max_token_length as usize;

        let mut entries = Vec::with_capacity(vocab_size);
        for id in 0..vocab_size {
            let score = f32::from_ne_bytes(read_array(&mut reader, "score", id)?);
            let len = i32::from_ne_bytes(read_array(&mut reader, "length", id)?);
            if len < 0 || len as usize > max_token_length {
                return Err(AxonError::Vocabulary(format!(
                    "token {id} has length {len}, limit is {max_token_length}"
                )));
            }
            let mut piece = vec![0u8; len as usize];
            reader.read_exact(&mut piece).map_err(|_| truncated("bytes", id))?;
            entries.push((piece, score));
        }

        let mut tokenizer = Self::from_entries(entries)?;
        tokenizer.max_token_length = max_token_length;
        Ok(tokenizer)
    }

    /// Build a tokenizer from `(piece, score)` pairs in id order.
    ///
    /// The first three entries are taken as unknown, BOS and EOS.
    pub fn from_entries(entries: impl IntoIterator<Item = (Vec<u8>, f32)>) -> Result<Self> {
        let (pieces, scores): (Vec<Vec<u8>>, Vec<f32>) = entries.into_iter().unzip();
        if pieces.len() <= EOS_TOKEN_ID as usize {
            return Err(AxonError::Vocabulary(format!(
                "vocabulary needs at least 3 entries, found {}",
                pieces.len()
            )));
        }

        let mut lookup = HashMap::with_capacity(pieces.len());
        for (id, piece) in pieces.iter().enumerate() {
            lookup.entry(piece.clone()).or_insert(id as u32);
        }
        let raw_bytes = pieces.iter().map(|p| parse_byte_piece(p)).collect();
        let max_token_length = pieces.iter().map(Vec::len).max().unwrap_or(0);

        Ok(Self {
            pieces,
            scores,
            raw_bytes,
            lookup,
            max_token_length,
        })
    }

    /// Encode text to token IDs.
    ///
    /// # Arguments
    ///
    /// * `text` - Text to encode
    /// * `add_bos` - Whether to prepend BOS token
    /// * `add_eos` - Whether to append EOS token
    pub fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<u32> {
        self.encode_bytes(text.as_bytes(), add_bos, add_eos)
    }

    /// Encode raw bytes, which need not be valid UTF-8.
    pub fn encode_bytes(&self, text: &[u8], add_bos: bool, add_eos: bool) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(text.len() + 3);
        if add_bos {
            tokens.push(BOS_TOKEN_ID);
        }

        if !text.is_empty() {
            // Leading space, as sentencepiece adds one to every input.
            tokens.push(self.token_id(b" ").unwrap_or(BYTE_FALLBACK_OFFSET + u32::from(b' ')));
        }

        let mut start = 0;
        while start < text.len() {
            let mut end = start + 1;
            // A code point is a lead byte plus at most three continuation bytes.
            while end < text.len() && end - start < 4 && is_continuation(text[end]) {
                end += 1;
            }
            let code_point = &text[start..end];
            match self.token_id(code_point) {
                Some(id) => tokens.push(id),
                None => tokens.extend(
                    code_point
                        .iter()
                        .map(|&b| BYTE_FALLBACK_OFFSET + u32::from(b)),
                ),
            }
            start = end;
        }

        self.merge(&mut tokens);

        if add_eos {
            tokens.push(EOS_TOKEN_ID);
        }
        tokens
    }

    fn merge(&self, tokens: &mut Vec<u32>) {
        let mut pair = Vec::with_capacity(self.max_token_length * 2);
        loop {
            let mut best: Option<(f32, usize, u32)> = None;
            for (i, window) in tokens.windows(2).enumerate() {
                pair.clear();
                pair.extend_from_slice(self.piece(window[0]));
                pair.extend_from_slice(self.piece(window[1]));
                if let Some(id) = self.token_id(&pair) {
                    let score = self.scores[id as usize];
                    if best.map_or(true, |(best_score, _, _)| score > best_score) {
                        best = Some((score, i, id));
                    }
                }
            }

            let Some((_, index, id)) = best else {
                break;
            };
            tokens[index] = id;
            tokens.remove(index + 1);
        }
    }

    /// Bytes of one token.
    ///
    /// `<0xHH>` pieces decode to the raw byte; unknown ids decode to nothing.
    pub fn decode(&self, token: u32) -> &[u8] {
        let id = token as usize;
        match self.raw_bytes.get(id) {
            Some(Some(byte)) => std::slice::from_ref(&BYTES[*byte as usize]),
            Some(None) => &self.pieces[id],
            None => &[],
        }
    }

    /// Piece as stored in the vocabulary.
    pub fn piece(&self, token: u32) -> &[u8] {
        self.pieces.get(token as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Merge score of a token.
    pub fn score(&self, token: u32) -> Option<f32> {
        self.scores.get(token as usize).copied()
    }

    /// Exact piece to id lookup.
    pub fn token_id(&self, piece: &[u8]) -> Option<u32> {
        self.lookup.get(piece).copied()
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    /// Longest piece in bytes.
    pub fn max_token_length(&self) -> usize {
        self.max_token_length
    }

    /// Get BOS token ID.
    pub fn bos_id(&self) -> u32 {
        BOS_TOKEN_ID
    }

    /// Get EOS token ID.
    pub fn eos_id(&self) -> u32 {
        EOS_TOKEN_ID
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("max_token_length", &self.max_token_length)
            .finish()
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Parse `<0xHH>`.
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    match piece {
        [b'<', b'0', b'x', hi, lo, b'>'] => {
            let hex = [*hi, *lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            u8::from_str_radix(hex, 16).ok()
        }
        _ => None,
    }
}

fn truncated(field: &str, id: usize) -> AxonError {
    AxonError::Vocabulary(format!("vocabulary truncated while reading {field} of token {id}"))
}

fn read_array<const N: usize>(reader: &mut impl Read, field: &str, id: usize) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|_| truncated(field, id))?;
    Ok(buf)
}

fn read_i32(reader: &mut impl Read, field: &str) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|_| {
        AxonError::Vocabulary(format!("vocabulary truncated while reading {field}"))
    })?;
    Ok(i32::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_factory::{sample_tokenizer, vocab_image};
    use proptest::prelude::*;

    fn pieces(tokenizer: &Tokenizer, tokens: &[u32]) -> Vec<String> {
        tokens
            .iter()
            .map(|&t| String::from_utf8_lossy(tokenizer.piece(t)).into_owned())
            .collect()
    }

    /// Concatenate decoded pieces, dropping the leading space after BOS.
    fn detokenize(tokenizer: &Tokenizer, tokens: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        for pair in tokens.windows(2) {
            let mut piece = tokenizer.decode(pair[1]);
            if pair[0] == BOS_TOKEN_ID && piece.first() == Some(&b' ') {
                piece = &piece[1..];
            }
            out.extend_from_slice(piece);
        }
        out
    }

    #[test]
    fn empty_text_is_just_bos() {
        let tokenizer = sample_tokenizer();
        assert_eq!(tokenizer.encode("", true, false), vec![BOS_TOKEN_ID]);
        assert_eq!(tokenizer.encode("", false, false), Vec::<u32>::new());
        assert_eq!(tokenizer.encode("", true, true), vec![BOS_TOKEN_ID, EOS_TOKEN_ID]);
    }

    #[test]
    fn merges_by_highest_score() {
        let tokenizer = sample_tokenizer();
        let tokens = tokenizer.encode("hello", true, false);
        assert_eq!(pieces(&tokenizer, &tokens), ["<s>", " hello"]);
    }

    #[test]
    fn words_split_on_spaces() {
        let tokenizer = sample_tokenizer();
        let tokens = tokenizer.encode("the hello", false, true);
        assert_eq!(pieces(&tokenizer, &tokens), [" the", " hello", "</s>"]);
    }

    #[test]
    fn ties_merge_leftmost_pair() {
        // "ab" and "bc" share a score; the leftmost pair wins.
        let mut entries = crate::test_factory::base_entries();
        for (piece, score) in [(" ", -1.0), ("a", -2.0), ("b", -3.0), ("c", -4.0)] {
            entries.push((piece.as_bytes().to_vec(), score));
        }
        entries.push((b"ab".to_vec(), 5.0));
        entries.push((b"bc".to_vec(), 5.0));
        let tokenizer = Tokenizer::from_entries(entries).unwrap();

        let tokens = tokenizer.encode("abc", false, false);
        assert_eq!(pieces(&tokenizer, &tokens), [" ", "ab", "c"]);
    }

    #[test]
    fn unknown_code_points_fall_back_to_bytes() {
        let tokenizer = sample_tokenizer();
        // U+00E9 is not in the vocabulary: two byte tokens.
        let tokens = tokenizer.encode("é", false, false);
        let space = tokenizer.token_id(b" ").unwrap();
        assert_eq!(tokens, vec![space, 0xC3 + 3, 0xA9 + 3]);
        assert_eq!(tokenizer.decode(tokens[1]), &[0xC3]);
        assert_eq!(tokenizer.decode(tokens[2]), &[0xA9]);
    }

    #[test]
    fn invalid_utf8_bytes_encode() {
        let tokenizer = sample_tokenizer();
        let text = [b'h', 0xFF, 0x80, b'e'];
        let tokens = tokenizer.encode_bytes(&text, true, false);
        assert_eq!(detokenize(&tokenizer, &tokens), text);
    }

    #[test]
    fn decode_handles_specials_and_unknown_ids() {
        let tokenizer = sample_tokenizer();
        assert_eq!(tokenizer.decode(BOS_TOKEN_ID), b"<s>");
        assert_eq!(tokenizer.decode(3 + 0x0A), b"\n");
        assert!(tokenizer.decode(100_000).is_empty());
        assert!(tokenizer.piece(100_000).is_empty());
        assert_eq!(tokenizer.score(100_000), None);
    }

    #[test]
    fn duplicate_pieces_resolve_to_first_id() {
        let mut entries = crate::test_factory::base_entries();
        entries.push((b"x".to_vec(), 0.0));
        entries.push((b"x".to_vec(), 1.0));
        let tokenizer = Tokenizer::from_entries(entries).unwrap();
        assert_eq!(tokenizer.token_id(b"x"), Some(259));
    }

    #[test]
    fn rejects_tiny_vocabulary() {
        let entries = vec![(b"<unk>".to_vec(), 0.0), (b"<s>".to_vec(), 0.0)];
        assert!(matches!(
            Tokenizer::from_entries(entries),
            Err(AxonError::Vocabulary(_))
        ));
    }

    #[test]
    fn reads_vocabulary_file() {
        let source = sample_tokenizer();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.bin");
        std::fs::write(&path, vocab_image(&source, 16)).unwrap();

        let loaded = Tokenizer::from_file(&path, source.vocab_size()).unwrap();
        assert_eq!(loaded.vocab_size(), source.vocab_size());
        assert_eq!(loaded.max_token_length(), 16);
        assert_eq!(
            loaded.encode("the hello", true, true),
            source.encode("the hello", true, true)
        );
        assert_eq!(loaded.score(300 - 1), source.score(300 - 1));
    }

    #[test]
    fn rejects_truncated_vocabulary() {
        let source = sample_tokenizer();
        let mut image = vocab_image(&source, 16);
        image.truncate(image.len() - 2);
        let err = Tokenizer::from_reader(image.as_slice(), source.vocab_size()).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn rejects_overlong_piece() {
        let source = sample_tokenizer();
        let image = vocab_image(&source, 2);
        let err = Tokenizer::from_reader(image.as_slice(), source.vocab_size()).unwrap_err();
        assert!(matches!(err, AxonError::Vocabulary(_)));
    }

    #[test]
    fn missing_file() {
        let err = Tokenizer::from_file("/nonexistent/tokenizer.bin", 32000).unwrap_err();
        assert!(matches!(err, AxonError::Vocabulary(_)));
    }

    #[test]
    fn byte_piece_parsing() {
        assert_eq!(parse_byte_piece(b"<0x0A>"), Some(0x0A));
        assert_eq!(parse_byte_piece(b"<0xff>"), Some(0xFF));
        assert_eq!(parse_byte_piece(b"<0xZZ>"), None);
        assert_eq!(parse_byte_piece(b"<0x0A"), None);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(text in "\\PC{1,40}") {
            let tokenizer = sample_tokenizer();
            let tokens = tokenizer.encode(&text, true, false);
            prop_assert_eq!(tokens[0], BOS_TOKEN_ID);
            prop_assert_eq!(detokenize(&tokenizer, &tokens), text.into_bytes());
        }

        #[test]
        fn encode_never_produces_unknown(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let tokenizer = sample_tokenizer();
            let tokens = tokenizer.encode_bytes(&bytes, false, false);
            prop_assert!(tokens.iter().all(|&t| t != UNK_TOKEN_ID && (t as usize) < tokenizer.vocab_size()));
        }
    }

    const TOKENIZER_PATH: &str = "tokenizer.bin";

    #[test]
    #[ignore = "requires model files"]
    fn llama_vocabulary_prompts() {
        let tokenizer = Tokenizer::from_file(TOKENIZER_PATH, 32000).unwrap();
        let cases: [(&str, &[u32]); 3] = [
            ("", &[1]),
            (
                "I believe the meaning of life is",
                &[1, 306, 4658, 278, 6593, 310, 2834, 338],
            ),
            (
                "Simply put, the theory of relativity states that ",
                &[1, 3439, 17632, 1925, 29892, 278, 6368, 310, 14215, 537, 5922, 393, 29871],
            ),
        ];
        for (prompt, expected) in cases {
            assert_eq!(tokenizer.encode(prompt, true, false), expected, "{prompt:?}");
        }
    }

    #[test]
    #[ignore = "requires model files"]
    fn llama_vocabulary_multiline_prompts() {
        let tokenizer = Tokenizer::from_file(TOKENIZER_PATH, 32000).unwrap();

        let prompt = "A brief message congratulating the team on the launch:\n\n        Hi everyone,\n\n        I just ";
        let expected = [
            1, 319, 11473, 2643, 378, 629, 271, 18099, 278, 3815, 373, 278, 6826, 29901, 13, 13,
            4706, 6324, 14332, 29892, 13, 13, 4706, 306, 925, 29871,
        ];
        assert_eq!(tokenizer.encode(prompt, true, false), expected);

        let prompt = "Translate English to French:\n\n        sea otter => loutre de mer\n        peppermint => menthe poivrée\n        plush girafe => girafe peluche\n        cheese =>";
        let expected = [
            1, 4103, 9632, 4223, 304, 5176, 29901, 13, 13, 4706, 7205, 4932, 357, 1149, 301, 449,
            276, 316, 2778, 13, 4706, 1236, 407, 837, 524, 1149, 6042, 354, 772, 440, 29878, 1318,
            13, 4706, 715, 1878, 330, 3055, 1725, 1149, 330, 3055, 1725, 4639, 28754, 13, 4706,
            923, 968, 1149,
        ];
        assert_eq!(tokenizer.encode(prompt, true, false), expected);
    }
}
