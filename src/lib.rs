//! Realtime Voxtral speech-to-text.
//!
//! The pipeline turns 16 kHz mono PCM into text with bounded latency and
//! memory: an incremental log-mel frontend feeds a sliding-window audio
//! encoder whose output is downsampled into decoder-rate embeddings; a
//! causal language decoder with rotating KV caches then interleaves audio
//! arrival with token prediction. [`transcribe::Transcriber`] runs the
//! one-shot file path, [`transcribe::RealtimeSession`] the chunked live
//! path.

pub mod audio;
pub mod error;
pub mod model;
pub mod tokenizer;
pub mod transcribe;

pub use error::{Error, Result};
