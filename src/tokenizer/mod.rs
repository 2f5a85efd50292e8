//! Tekken tokenizer support.
//!
//! The pipeline only needs the byte-oriented slice of the tokenizer: special
//! token lookup by name, per-token decoded bytes, and the audio metadata
//! block. Encoding is never required since the realtime preamble is built
//! from special tokens alone.

use std::path::Path;

use base64::Engine;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const STREAMING_PAD_TOKEN: &str = "[STREAMING_PAD]";

#[derive(Debug, Clone, Deserialize)]
pub struct AudioMetadata {
    pub sampling_rate: u32,
    pub frame_rate: f64,
    #[serde(default)]
    pub transcription_delay_ms: Option<u64>,
    #[serde(default)]
    pub streaming_n_left_pad_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct VocabEntry {
    rank: u32,
    #[serde(default)]
    token_bytes: Option<String>,
    #[serde(default)]
    token_str: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpecialEntry {
    rank: u32,
    token_str: String,
    #[serde(default)]
    is_control: bool,
}

#[derive(Debug, Deserialize)]
struct TekkenConfig {
    num_vocab_tokens: usize,
    #[serde(default)]
    default_vocab_size: Option<usize>,
    #[serde(default)]
    default_num_special_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TekkenFile {
    config: TekkenConfig,
    vocab: Vec<VocabEntry>,
    special_tokens: Vec<SpecialEntry>,
    #[serde(default)]
    audio: Option<AudioMetadata>,
}

#[derive(Debug, Clone)]
struct SpecialToken {
    token_str: String,
    is_control: bool,
}

/// Byte-level tokenizer loaded from `tekken.json`.
///
/// Token ids are laid out as `[0, num_special)` for special tokens (by
/// rank) followed by the regular vocabulary shifted up by `num_special`.
pub struct TekkenTokenizer {
    vocab: Vec<Vec<u8>>,
    specials: Vec<SpecialToken>,
    num_special: usize,
    audio: Option<AudioMetadata>,
}

impl TekkenTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: TekkenFile = serde_json::from_str(raw)?;

        let num_special = file
            .config
            .default_num_special_tokens
            .unwrap_or(file.special_tokens.len());

        let mut specials = vec![
            SpecialToken {
                token_str: String::new(),
                is_control: true,
            };
            num_special
        ];
        for entry in file.special_tokens {
            let rank = entry.rank as usize;
            if rank < num_special {
                specials[rank] = SpecialToken {
                    token_str: entry.token_str,
                    is_control: entry.is_control,
                };
            }
        }

        // The usable vocabulary may be smaller than the shipped table.
        let usable = file
            .config
            .default_vocab_size
            .unwrap_or(file.config.num_vocab_tokens)
            .saturating_sub(num_special);

        let mut vocab = vec![Vec::new(); usable.min(file.vocab.len())];
        let b64 = base64::engine::general_purpose::STANDARD;
        for entry in file.vocab {
            let rank = entry.rank as usize;
            if rank >= vocab.len() {
                continue;
            }
            vocab[rank] = match (&entry.token_bytes, &entry.token_str) {
                (Some(bytes), _) => b64.decode(bytes).map_err(|e| {
                    Error::UnsupportedModelFormat(format!(
                        "tekken vocab rank {rank}: bad base64 token bytes: {e}"
                    ))
                })?,
                (None, Some(s)) => s.as_bytes().to_vec(),
                (None, None) => Vec::new(),
            };
        }

        Ok(Self {
            vocab,
            specials,
            num_special,
            audio: file.audio,
        })
    }

    /// Look up a special token id by its literal string, e.g. `"<s>"`.
    pub fn special_token_id(&self, name: &str) -> Option<u32> {
        self.specials
            .iter()
            .position(|s| s.token_str == name)
            .map(|rank| rank as u32)
    }

    pub fn bos_id(&self) -> Option<u32> {
        self.special_token_id(BOS_TOKEN)
    }

    pub fn eos_id(&self) -> Option<u32> {
        self.special_token_id(EOS_TOKEN)
    }

    /// Raw bytes for one token id. Control special tokens always decode to
    /// empty bytes; with `ignore_special` every special token does.
    pub fn decoded_bytes(&self, id: u32, ignore_special: bool) -> &[u8] {
        let id = id as usize;
        if id < self.num_special {
            let special = &self.specials[id];
            if ignore_special || special.is_control {
                &[]
            } else {
                special.token_str.as_bytes()
            }
        } else {
            self.vocab
                .get(id - self.num_special)
                .map(|b| b.as_slice())
                .unwrap_or(&[])
        }
    }

    /// Lossy UTF-8 decode of a token sequence.
    pub fn decode(&self, ids: &[u32], ignore_special: bool) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            bytes.extend_from_slice(self.decoded_bytes(id, ignore_special));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn audio_metadata(&self) -> Option<&AudioMetadata> {
        self.audio.as_ref()
    }

    pub fn vocab_len(&self) -> usize {
        self.num_special + self.vocab.len()
    }
}

/// Minimal tekken fixture shared by unit tests across the crate.
#[cfg(test)]
pub(crate) const MINI_TEKKEN: &str = r#"{
        "config": {
            "num_vocab_tokens": 8,
            "default_vocab_size": 8,
            "default_num_special_tokens": 4
        },
        "special_tokens": [
            {"rank": 0, "token_str": "<unk>", "is_control": true},
            {"rank": 1, "token_str": "<s>", "is_control": true},
            {"rank": 2, "token_str": "</s>", "is_control": true},
            {"rank": 3, "token_str": "[STREAMING_PAD]", "is_control": true}
        ],
        "vocab": [
            {"rank": 0, "token_bytes": "QQ=="},
            {"rank": 1, "token_bytes": "Qg=="},
            {"rank": 2, "token_bytes": "4Q=="},
            {"rank": 3, "token_bytes": "IA=="}
        ],
        "audio": {
            "sampling_rate": 16000,
            "frame_rate": 12.5,
            "transcription_delay_ms": 480,
            "streaming_n_left_pad_tokens": 32
        }
    }"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_token_ids() {
        let tok = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        assert_eq!(tok.bos_id(), Some(1));
        assert_eq!(tok.eos_id(), Some(2));
        assert_eq!(tok.special_token_id(STREAMING_PAD_TOKEN), Some(3));
        assert_eq!(tok.special_token_id("<nope>"), None);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tok = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        assert_eq!(tok.decode(&[1, 4, 1, 2, 2], true), "A");
    }

    #[test]
    fn decoded_bytes_shift_past_specials() {
        let tok = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        assert_eq!(tok.decoded_bytes(4, true), b"A");
        assert_eq!(tok.decoded_bytes(5, true), b"B");
        assert_eq!(tok.decoded_bytes(6, true), &[0xE1]);
        assert_eq!(tok.decoded_bytes(2, true), b"");
        assert_eq!(tok.decoded_bytes(99, true), b"");
    }

    #[test]
    fn audio_metadata_is_exposed() {
        let tok = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        let audio = tok.audio_metadata().unwrap();
        assert_eq!(audio.sampling_rate, 16000);
        assert_eq!(audio.transcription_delay_ms, Some(480));
        assert_eq!(audio.streaming_n_left_pad_tokens, Some(32));
    }
}
