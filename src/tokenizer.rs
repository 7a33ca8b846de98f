//! Byte-pair tokenizer with a scored merge loop
//!
//! # File format
//!
//! ```text
//! i32            max_token_length
//! per entry:     f32 score, i32 len, len bytes
//! ```
//!
//! Vocabulary entries are raw byte strings (byte-fallback entries are not
//! valid UTF-8 on their own), so the tokenizer works on `&[u8]` throughout.
//! Lookup goes through a lexicographically sorted id permutation and binary
//! search; encoding seeds one token per representable input byte and then
//! greedily merges the adjacent pair with the highest merge score until no
//! adjacent pair exists in the vocabulary.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use thiserror::Error;

use crate::sidecar::{read_f32, read_lp_bytes};

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("failed to read tokenizer file: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated tokenizer file: {0}")]
    Truncated(String),
}

pub struct Tokenizer {
    vocab: Vec<Vec<u8>>,
    scores: Vec<f32>,
    /// Token ids sorted lexicographically by their vocabulary bytes.
    sorted_ids: Vec<u32>,
    pub max_token_length: usize,
}

impl Tokenizer {
    /// Load a tokenizer file. `vocab_size` comes from the model config.
    pub fn load<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Self, TokenizerError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);

        let max_token_length = crate::sidecar::read_i32(&mut reader).map_err(|e| {
            TokenizerError::Truncated(format!("missing max_token_length: {e}"))
        })?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for i in 0..vocab_size {
            let score = read_f32(&mut reader)
                .map_err(|e| TokenizerError::Truncated(format!("entry {i} score: {e}")))?;
            let bytes = read_lp_bytes(&mut reader)
                .map_err(|e| TokenizerError::Truncated(format!("entry {i} bytes: {e}")))?;
            scores.push(score);
            vocab.push(bytes);
        }

        let mut sorted_ids: Vec<u32> = (0..vocab_size as u32).collect();
        sorted_ids.sort_unstable_by(|&a, &b| vocab[a as usize].cmp(&vocab[b as usize]));

        tracing::debug!(vocab_size, max_token_length, "tokenizer loaded");

        Ok(Self {
            vocab,
            scores,
            sorted_ids,
            max_token_length: max_token_length.max(0) as usize,
        })
    }

    /// Binary search the vocabulary for an exact byte string.
    pub fn find(&self, piece: &[u8]) -> Option<u32> {
        self.sorted_ids
            .binary_search_by(|&id| self.vocab[id as usize].as_slice().cmp(piece))
            .ok()
            .map(|pos| self.sorted_ids[pos])
    }

    /// Encode text into token ids.
    ///
    /// Bytes with no single-byte vocabulary entry are discarded, so an input
    /// with no representable byte encodes to an empty sequence.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut tokens: Vec<u32> = text
            .as_bytes()
            .iter()
            .filter_map(|&b| self.find(&[b]))
            .collect();

        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best: Option<(usize, u32)> = None;

            for i in 0..tokens.len().saturating_sub(1) {
                let mut piece = self.vocab[tokens[i] as usize].clone();
                piece.extend_from_slice(&self.vocab[tokens[i + 1] as usize]);
                if let Some(id) = self.find(&piece) {
                    if self.scores[id as usize] > best_score {
                        best_score = self.scores[id as usize];
                        best = Some((i, id));
                    }
                }
            }

            match best {
                Some((idx, id)) => {
                    tokens[idx] = id;
                    tokens.remove(idx + 1);
                }
                None => break,
            }
        }

        tokens
    }

    /// The raw vocabulary bytes of a token. Spacing conventions are the
    /// caller's concern.
    pub fn decode(&self, token: u32) -> &[u8] {
        self.vocab
            .get(token as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::{write_f32, write_i32, write_lp_bytes};
    use std::io::Write;
    use tempfile::tempdir;

    /// Build a tokenizer file from (score, piece) entries.
    fn write_tokenizer(entries: &[(f32, &[u8])]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokenizer.bin");
        let mut f = std::fs::File::create(&path).unwrap();

        let max_len = entries.iter().map(|(_, p)| p.len()).max().unwrap_or(0);
        write_i32(&mut f, max_len as i32).unwrap();
        for (score, piece) in entries {
            write_f32(&mut f, *score).unwrap();
            write_lp_bytes(&mut f, piece).unwrap();
        }
        f.flush().unwrap();
        (dir, path)
    }

    fn toy_tokenizer() -> (tempfile::TempDir, Tokenizer) {
        // Single-byte seeds plus scored merges: "ab" merges before "abc".
        let entries: Vec<(f32, &[u8])> = vec![
            (0.0, b"a"),
            (0.0, b"b"),
            (0.0, b"c"),
            (2.0, b"ab"),
            (3.0, b"abc"),
            (1.0, b"bc"),
        ];
        let (dir, path) = write_tokenizer(&entries);
        let tok = Tokenizer::load(&path, entries.len()).unwrap();
        (dir, tok)
    }

    #[test]
    fn merges_pick_highest_score_first() {
        let (_dir, tok) = toy_tokenizer();
        // a b c → (ab) c → (abc)
        assert_eq!(tok.encode("abc"), vec![4]);
    }

    #[test]
    fn unmergeable_bytes_stay_separate() {
        let (_dir, tok) = toy_tokenizer();
        // "ba" has no merge entry.
        assert_eq!(tok.encode("ba"), vec![1, 0]);
    }

    #[test]
    fn unrepresentable_input_encodes_empty() {
        let (_dir, tok) = toy_tokenizer();
        assert_eq!(tok.encode("xyz"), Vec::<u32>::new());
    }

    #[test]
    fn unknown_bytes_are_discarded_not_fatal() {
        let (_dir, tok) = toy_tokenizer();
        assert_eq!(tok.encode("axbxc"), vec![4]);
    }

    #[test]
    fn decode_returns_raw_bytes() {
        let (_dir, tok) = toy_tokenizer();
        assert_eq!(tok.decode(3), b"ab");
        assert_eq!(tok.decode(999), b"");
    }

    #[test]
    fn truncated_file_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokenizer.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        write_i32(&mut f, 8).unwrap();
        write_f32(&mut f, 1.0).unwrap();
        // Length prefix promises 100 bytes that never arrive.
        write_i32(&mut f, 100).unwrap();
        f.flush().unwrap();

        let result = Tokenizer::load(&path, 2);
        assert!(matches!(result, Err(TokenizerError::Truncated(_))));
    }
}
