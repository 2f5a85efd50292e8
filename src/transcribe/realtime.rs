//! Stateful realtime transcription session.
//!
//! Audio arrives in arbitrary slices, is re-chunked internally to a fixed
//! whole number of 80 ms audio tokens, and flows through the incremental
//! mel frontend and encoder into an audio-embedding queue. The decoder
//! consumes that queue in lock-step with decoded positions, held back by
//! the look-ahead guard until enough future audio has been fed. Text is
//! emitted as UTF-8 becomes valid across token boundaries; an EOS token
//! closes the transcript with a newline and resets the whole stream.

use std::collections::VecDeque;
use std::sync::Arc;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::audio::mel;
use crate::error::{Error, Result};
use crate::model::{decoder, EncoderState, RotatingKvCache, VoxtralModel};
use crate::tokenizer::{TekkenTokenizer, BOS_TOKEN, EOS_TOKEN, STREAMING_PAD_TOKEN};

const TOKEN_DURATION_MS: i64 = 80;

/// Consumed PCM is dropped from the front of the queue once it passes this
/// size and makes up at least half of it.
const PCM_COMPACT_THRESHOLD: usize = 32 * 1024;

/// Whether a decode pass honors the audio look-ahead lower bound or drains
/// every buffered embedding (stream finalization).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeMode {
    Guarded,
    All,
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub temperature: f64,
    /// Rounded to the nearest whole number of 80 ms audio tokens, minimum
    /// one token.
    pub chunk_duration_ms: i64,
    /// Overrides the tokenizer's audio metadata when set.
    pub transcription_delay_ms: Option<u64>,
    pub right_pad_tokens: usize,
    /// Defaults to the decoder sliding window, never below 256.
    pub decoder_window_tokens: Option<usize>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            chunk_duration_ms: TOKEN_DURATION_MS,
            transcription_delay_ms: None,
            right_pad_tokens: 17,
            decoder_window_tokens: None,
        }
    }
}

pub struct RealtimeSession {
    model: Arc<VoxtralModel>,
    tokenizer: Arc<TekkenTokenizer>,
    temperature: f64,
    chunk_samples: usize,
    samples_per_token: usize,
    left_pad_tokens: usize,
    right_pad_tokens: usize,
    eos_id: u32,
    prefix_len: usize,
    prefix_embeds: Tensor,
    ada_scales: Vec<Tensor>,
    rng: StdRng,

    pending_pcm: Vec<f32>,
    pcm_consumed: usize,
    mel_tail: Option<Vec<f32>>,
    enc_state: EncoderState,
    audio_embeds: VecDeque<Tensor>,
    dec_caches: Vec<RotatingKvCache>,
    pending_bytes: Vec<u8>,
    current_token: u32,
    first_cycle: bool,
    prefilled: bool,
    total_samples_fed: usize,
    total_decoded: usize,
}

impl RealtimeSession {
    pub fn new(
        model: Arc<VoxtralModel>,
        tokenizer: Arc<TekkenTokenizer>,
        opts: RealtimeOptions,
    ) -> Result<Self> {
        if opts.chunk_duration_ms <= 0 {
            return Err(Error::InvalidChunkDuration(opts.chunk_duration_ms));
        }
        let cfg = &model.config;
        let samples_per_token = cfg.samples_per_token();
        let chunk_tokens =
            ((opts.chunk_duration_ms as f64 / TOKEN_DURATION_MS as f64).round() as usize).max(1);
        let chunk_samples = chunk_tokens * samples_per_token;

        let audio_meta = tokenizer.audio_metadata();
        let delay_ms = opts
            .transcription_delay_ms
            .or_else(|| audio_meta.and_then(|a| a.transcription_delay_ms))
            .unwrap_or(480);
        let delay_tokens = (delay_ms / TOKEN_DURATION_MS as u64) as usize;
        let left_pad_tokens = audio_meta
            .and_then(|a| a.streaming_n_left_pad_tokens)
            .unwrap_or(32);

        let bos = tokenizer
            .bos_id()
            .ok_or(Error::MissingSpecialToken(BOS_TOKEN))?;
        let eos_id = tokenizer
            .eos_id()
            .ok_or(Error::MissingSpecialToken(EOS_TOKEN))?;
        let pad = tokenizer
            .special_token_id(STREAMING_PAD_TOKEN)
            .ok_or(Error::MissingSpecialToken(STREAMING_PAD_TOKEN))?;

        let mut prefix_ids: Vec<u32> = vec![bos];
        prefix_ids.extend(std::iter::repeat(pad).take(left_pad_tokens + delay_tokens));
        let prefix_embeds = model.decoder.embed_ids(&prefix_ids)?;

        let t_cond = decoder::time_embedding(delay_tokens as f32, cfg.dim, &model.device)?;
        let ada_scales = model.decoder.ada_scales(&t_cond)?;

        let decoder_window = opts
            .decoder_window_tokens
            .unwrap_or(cfg.sliding_window)
            .max(256);
        let dec_caches = model.decoder.new_caches(decoder_window);
        let enc_state = model.encoder.new_state();

        info!(
            chunk_samples,
            delay_tokens, left_pad_tokens, decoder_window, "realtime session ready"
        );

        Ok(Self {
            temperature: opts.temperature,
            chunk_samples,
            samples_per_token,
            left_pad_tokens,
            right_pad_tokens: opts.right_pad_tokens,
            eos_id,
            prefix_len: prefix_ids.len(),
            prefix_embeds,
            ada_scales,
            rng: StdRng::from_entropy(),
            pending_pcm: Vec::new(),
            pcm_consumed: 0,
            mel_tail: None,
            enc_state,
            audio_embeds: VecDeque::new(),
            dec_caches,
            pending_bytes: Vec::new(),
            current_token: bos,
            first_cycle: true,
            prefilled: false,
            total_samples_fed: 0,
            total_decoded: 0,
            model,
            tokenizer,
        })
    }

    /// Feed PCM samples (16 kHz mono) and return whatever text became
    /// decodable. An empty fragment is normal while buffers fill or the
    /// look-ahead guard holds the decoder back.
    pub fn append_audio_samples(&mut self, samples: &[f32]) -> Result<String> {
        self.pending_pcm.extend_from_slice(samples);
        let mut out = String::new();
        while self.pending_pcm.len() - self.pcm_consumed >= self.chunk_samples {
            let start = self.pcm_consumed;
            let chunk: Vec<f32> = self.pending_pcm[start..start + self.chunk_samples].to_vec();
            self.pcm_consumed += self.chunk_samples;
            self.compact_pcm();
            self.feed_chunk(&chunk)?;
            let fragment = self.decode_available(DecodeMode::Guarded)?;
            out.push_str(&fragment);
        }
        Ok(out)
    }

    /// Close the stream: flush the encoder with trailing silence, decode
    /// everything buffered regardless of look-ahead, emit the held-back
    /// token and any residual bytes, then reset for a fresh stream.
    pub fn finish_stream(&mut self) -> Result<String> {
        let mut out = String::new();
        self.pending_pcm.extend(
            std::iter::repeat(0f32).take(self.right_pad_tokens * self.samples_per_token),
        );
        while self.pending_pcm.len() - self.pcm_consumed >= self.chunk_samples {
            let start = self.pcm_consumed;
            let chunk: Vec<f32> = self.pending_pcm[start..start + self.chunk_samples].to_vec();
            self.pcm_consumed += self.chunk_samples;
            self.feed_chunk(&chunk)?;
        }
        out.push_str(&self.decode_available(DecodeMode::All)?);

        if self.prefilled && self.current_token != self.eos_id {
            let bytes = self.tokenizer.decoded_bytes(self.current_token, true);
            self.pending_bytes.extend_from_slice(bytes);
        }
        if !self.pending_bytes.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending_bytes));
        }

        self.reset_stream();
        self.pending_pcm.clear();
        self.pcm_consumed = 0;
        Ok(out)
    }

    pub fn is_prefilled(&self) -> bool {
        self.prefilled
    }

    pub fn decoded_positions(&self) -> usize {
        self.total_decoded
    }

    pub fn buffered_embedding_rows(&self) -> usize {
        self.audio_embeds.len()
    }

    fn compact_pcm(&mut self) {
        if self.pcm_consumed > PCM_COMPACT_THRESHOLD
            && self.pcm_consumed * 2 >= self.pending_pcm.len()
        {
            self.pending_pcm.drain(..self.pcm_consumed);
            self.pcm_consumed = 0;
        }
    }

    /// Run one chunk through the mel frontend and encoder. The chunk's
    /// samples count toward the look-ahead guard; stream-start left padding
    /// does not.
    fn feed_chunk(&mut self, chunk: &[f32]) -> Result<()> {
        let fed: Vec<f32> = if self.first_cycle {
            // Stream start: silence gives the encoder left context before
            // the first real samples.
            self.first_cycle = false;
            let mut padded = vec![0f32; self.left_pad_tokens * self.samples_per_token];
            padded.extend_from_slice(chunk);
            padded
        } else {
            chunk.to_vec()
        };

        let (mel, new_tail) = mel::log_mel_step(&fed, self.mel_tail.as_deref(), &self.model.device)?;
        self.mel_tail = Some(new_tail);

        if let Some(rows) = self.model.encoder.encode_step(&mel, &mut self.enc_state)? {
            for i in 0..rows.dim(0)? {
                self.audio_embeds.push_back(rows.narrow(0, i, 1)?);
            }
        }
        self.total_samples_fed += chunk.len();
        Ok(())
    }

    /// Highest decoder position currently allowed by the look-ahead guard.
    fn guarded_limit(&self) -> usize {
        self.left_pad_tokens + self.total_samples_fed / self.samples_per_token
    }

    fn decode_available(&mut self, mode: DecodeMode) -> Result<String> {
        let mut out = String::new();

        if !self.prefilled {
            if self.audio_embeds.len() < self.prefix_len {
                return Ok(out);
            }
            let rows: Vec<Tensor> = self.audio_embeds.drain(..self.prefix_len).collect();
            let refs: Vec<&Tensor> = rows.iter().collect();
            let audio = Tensor::cat(&refs, 0)?.unsqueeze(0)?;
            let input = (audio + &self.prefix_embeds)?;
            let hidden =
                self.model
                    .decoder
                    .forward(&input, &self.ada_scales, &mut self.dec_caches)?;
            let last = hidden.narrow(1, self.prefix_len - 1, 1)?;
            let logits = self.model.decoder.lm_head(&last)?;
            let token = decoder::sample_token(&logits, self.temperature, &mut self.rng)?;
            self.prefilled = true;
            self.total_decoded = self.prefix_len;
            self.current_token = token;
            debug!(first_token = token, "prefill complete");
            if token == self.eos_id {
                out.push('\n');
                self.reset_stream();
                return Ok(out);
            }
        }

        loop {
            if mode == DecodeMode::Guarded && self.total_decoded >= self.guarded_limit() {
                break;
            }
            let Some(row) = self.audio_embeds.pop_front() else {
                break;
            };
            let prev = self.current_token;
            let emb = self.model.decoder.embed_ids(&[prev])?;
            let input = (emb + row.unsqueeze(0)?)?;
            let hidden =
                self.model
                    .decoder
                    .forward(&input, &self.ada_scales, &mut self.dec_caches)?;
            let logits = self.model.decoder.lm_head(&hidden)?;
            let next = decoder::sample_token(&logits, self.temperature, &mut self.rng)?;
            self.total_decoded += 1;

            // The previous token is only emitted now that its successor is
            // known; EOS never reaches the byte queue.
            self.pending_bytes
                .extend_from_slice(self.tokenizer.decoded_bytes(prev, true));
            out.push_str(&take_valid_utf8(&mut self.pending_bytes));

            self.current_token = next;
            if next == self.eos_id {
                out.push('\n');
                self.reset_stream();
                break;
            }
        }
        Ok(out)
    }

    /// Clear all per-stream state so the next samples start a fresh
    /// transcript. Unconsumed queued PCM survives.
    fn reset_stream(&mut self) {
        self.mel_tail = None;
        self.enc_state.reset();
        self.audio_embeds.clear();
        for cache in &mut self.dec_caches {
            cache.reset();
        }
        self.pending_bytes.clear();
        self.first_cycle = true;
        self.prefilled = false;
        self.total_samples_fed = 0;
        self.total_decoded = 0;
    }
}

/// Split off the longest valid UTF-8 prefix ending on a code point
/// boundary, leaving a trailing partial character in place.
pub(crate) fn take_valid_utf8(bytes: &mut Vec<u8>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => {
            let s = s.to_owned();
            bytes.clear();
            s
        }
        Err(err) => {
            let valid = err.valid_up_to();
            let s = String::from_utf8_lossy(&bytes[..valid]).into_owned();
            bytes.drain(..valid);
            s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tiny_model;
    use crate::tokenizer::MINI_TEKKEN;
    use candle_core::Device;

    fn session(opts: RealtimeOptions) -> Result<RealtimeSession> {
        let model = Arc::new(tiny_model(&Device::Cpu));
        let tokenizer = Arc::new(TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap());
        RealtimeSession::new(model, tokenizer, opts)
    }

    #[test]
    fn rejects_non_positive_chunk_duration() {
        let result = session(RealtimeOptions {
            chunk_duration_ms: 0,
            ..Default::default()
        });
        let Err(err) = result else {
            panic!("expected InvalidChunkDuration");
        };
        assert!(matches!(err, Error::InvalidChunkDuration(0)));
    }

    #[test]
    fn missing_streaming_pad_is_an_error() {
        let json = r#"{
            "config": {"num_vocab_tokens": 4, "default_num_special_tokens": 2},
            "special_tokens": [
                {"rank": 0, "token_str": "<s>", "is_control": true},
                {"rank": 1, "token_str": "</s>", "is_control": true}
            ],
            "vocab": [{"rank": 0, "token_bytes": "QQ=="}]
        }"#;
        let model = Arc::new(tiny_model(&Device::Cpu));
        let tokenizer = Arc::new(TekkenTokenizer::from_json_str(json).unwrap());
        let result = RealtimeSession::new(model, tokenizer, RealtimeOptions::default());
        let Err(err) = result else {
            panic!("expected MissingSpecialToken");
        };
        assert!(matches!(
            err,
            Error::MissingSpecialToken(STREAMING_PAD_TOKEN)
        ));
    }

    #[test]
    fn chunk_duration_rounds_to_whole_tokens() {
        let s = session(RealtimeOptions {
            chunk_duration_ms: 120,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.chunk_samples, 2 * 1280);

        let s = session(RealtimeOptions {
            chunk_duration_ms: 10,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.chunk_samples, 1280);
    }

    #[test]
    fn prefill_waits_for_the_prompt_worth_of_audio() {
        let mut s = session(RealtimeOptions::default()).unwrap();
        // Seven audio tokens: 32 left-pad rows + 6 buffered = not enough
        // for the 39-position prompt.
        let out = s.append_audio_samples(&vec![0f32; 7 * 1280]).unwrap();
        assert!(out.is_empty());
        assert!(!s.is_prefilled());

        // The eighth token tips it over.
        s.append_audio_samples(&vec![0f32; 1280]).unwrap();
        assert!(s.is_prefilled());
        assert_eq!(s.decoded_positions(), 39);
    }

    #[test]
    fn look_ahead_guard_bounds_decoded_positions() {
        let mut s = session(RealtimeOptions::default()).unwrap();
        s.append_audio_samples(&vec![0f32; 16 * 1280]).unwrap();
        let limit = s.left_pad_tokens + s.total_samples_fed / s.samples_per_token;
        assert!(s.decoded_positions() <= limit);
    }

    #[test]
    fn caller_chunking_does_not_change_output() {
        let samples = vec![0f32; 2 * mel::SAMPLE_RATE];

        let mut all = String::new();
        let mut s = session(RealtimeOptions::default()).unwrap();
        all.push_str(&s.append_audio_samples(&samples).unwrap());
        all.push_str(&s.finish_stream().unwrap());

        let mut chunked = String::new();
        let mut s = session(RealtimeOptions::default()).unwrap();
        for piece in samples.chunks(317) {
            chunked.push_str(&s.append_audio_samples(piece).unwrap());
        }
        chunked.push_str(&s.finish_stream().unwrap());

        assert_eq!(all, chunked);
    }

    #[test]
    fn finish_resets_for_a_new_stream() {
        let mut s = session(RealtimeOptions::default()).unwrap();
        s.append_audio_samples(&vec![0f32; 16 * 1280]).unwrap();
        s.finish_stream().unwrap();
        assert!(!s.is_prefilled());
        assert_eq!(s.decoded_positions(), 0);
        assert_eq!(s.buffered_embedding_rows(), 0);

        // The session accepts a second stream from scratch.
        s.append_audio_samples(&vec![0f32; 16 * 1280]).unwrap();
        assert!(s.is_prefilled());
    }

    #[test]
    fn utf8_reassembly_across_token_boundaries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice("ab".as_bytes());
        bytes.push(0xE2); // first byte of a three-byte sequence
        assert_eq!(take_valid_utf8(&mut bytes), "ab");
        assert_eq!(bytes, vec![0xE2]);

        bytes.extend_from_slice(&[0x82, 0xAC]); // completes U+20AC
        assert_eq!(take_valid_utf8(&mut bytes), "\u{20AC}");
        assert!(bytes.is_empty());
    }
}
