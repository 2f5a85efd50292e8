//! One-shot transcription: pad, encode the whole clip, prefill the decoder
//! prompt, then run the autoregressive loop over the remaining audio
//! positions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::audio::mel;
use crate::error::{Error, Result};
use crate::model::{decoder, VoxtralModel};
use crate::tokenizer::{TekkenTokenizer, BOS_TOKEN, STREAMING_PAD_TOKEN};

const TOKEN_DURATION_MS: u64 = 80;

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub temperature: f64,
    pub max_new_tokens: usize,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_new_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionStats {
    pub audio_secs: f64,
    pub elapsed: Duration,
    pub decoded_tokens: usize,
}

impl TranscriptionStats {
    /// Processing time over audio time; below 1.0 means faster than
    /// realtime.
    pub fn real_time_factor(&self) -> Option<f64> {
        (self.audio_secs > 0.0).then(|| self.elapsed.as_secs_f64() / self.audio_secs)
    }
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub stats: TranscriptionStats,
}

pub struct Transcriber {
    model: Arc<VoxtralModel>,
    tokenizer: Arc<TekkenTokenizer>,
}

impl Transcriber {
    pub fn new(model: Arc<VoxtralModel>, tokenizer: Arc<TekkenTokenizer>) -> Self {
        Self { model, tokenizer }
    }

    /// Transcribe a 16 kHz mono clip.
    pub fn transcribe(&self, samples: &[f32], opts: &TranscribeOptions) -> Result<Transcription> {
        let start = Instant::now();
        let cfg = &self.model.config;
        let spt = cfg.samples_per_token();

        let audio_meta = self.tokenizer.audio_metadata();
        let delay_ms = audio_meta
            .and_then(|a| a.transcription_delay_ms)
            .unwrap_or(480);
        let delay_tokens = (delay_ms / TOKEN_DURATION_MS) as usize;
        let left_pad_tokens = audio_meta
            .and_then(|a| a.streaming_n_left_pad_tokens)
            .unwrap_or(32);

        let bos = self
            .tokenizer
            .bos_id()
            .ok_or(Error::MissingSpecialToken(BOS_TOKEN))?;
        let pad = self
            .tokenizer
            .special_token_id(STREAMING_PAD_TOKEN)
            .ok_or(Error::MissingSpecialToken(STREAMING_PAD_TOKEN))?;
        let eos = self.tokenizer.eos_id();

        let mut prefix: Vec<u32> = vec![bos];
        prefix.extend(std::iter::repeat(pad).take(left_pad_tokens + delay_tokens));
        let prefix_len = prefix.len();
        let right_pad_tokens = delay_tokens + 1 + 10;

        // Silence on both sides: encoder context on the left, enough on the
        // right to flush the delayed decode window.
        let mut padded = vec![0f32; left_pad_tokens * spt];
        padded.extend_from_slice(samples);
        let align = (spt - padded.len() % spt) % spt;
        padded.extend(std::iter::repeat(0f32).take(align + right_pad_tokens * spt));

        let mel = mel::log_mel_offline(&padded, &self.model.device)?;
        let audio_embeds = self.model.encoder.encode(&mel)?;
        let available = audio_embeds.dim(0)?;
        if available < prefix_len {
            return Err(Error::AudioTooShortForPrompt {
                required: prefix_len,
                available,
            });
        }

        let t_cond = decoder::time_embedding(delay_tokens as f32, cfg.dim, &self.model.device)?;
        let ada_scales = self.model.decoder.ada_scales(&t_cond)?;
        let mut caches = self.model.decoder.new_caches(cfg.sliding_window.max(256));

        // Prompt token embeddings added elementwise onto the leading audio
        // embedding rows.
        let prompt = self.model.decoder.embed_ids(&prefix)?;
        let audio_prefix = audio_embeds.narrow(0, 0, prefix_len)?.unsqueeze(0)?;
        let input = (prompt + audio_prefix)?;
        let hidden = self
            .model
            .decoder
            .forward(&input, &ada_scales, &mut caches)?;
        let last = hidden.narrow(1, prefix_len - 1, 1)?;

        let mut rng = StdRng::from_entropy();
        let mut current = decoder::sample_token(
            &self.model.decoder.lm_head(&last)?,
            opts.temperature,
            &mut rng,
        )?;

        let max_tokens = opts.max_new_tokens.min(available - prefix_len + 1);
        let mut generated: Vec<u32> = Vec::new();
        loop {
            if Some(current) == eos {
                break;
            }
            generated.push(current);
            if generated.len() >= max_tokens {
                break;
            }
            let row = prefix_len + generated.len() - 1;
            let emb = self.model.decoder.embed_ids(&[current])?;
            let audio_row = audio_embeds.narrow(0, row, 1)?.unsqueeze(0)?;
            let hidden = self.model.decoder.forward(
                &(emb + audio_row)?,
                &ada_scales,
                &mut caches,
            )?;
            current = decoder::sample_token(
                &self.model.decoder.lm_head(&hidden)?,
                opts.temperature,
                &mut rng,
            )?;
        }

        let text = self.tokenizer.decode(&generated, true).trim().to_string();
        let stats = TranscriptionStats {
            audio_secs: samples.len() as f64 / mel::SAMPLE_RATE as f64,
            elapsed: start.elapsed(),
            decoded_tokens: generated.len(),
        };
        info!(
            decoded_tokens = stats.decoded_tokens,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "transcription complete"
        );
        Ok(Transcription { text, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tiny_model;
    use crate::tokenizer::MINI_TEKKEN;
    use candle_core::Device;

    fn transcriber() -> Transcriber {
        let model = Arc::new(tiny_model(&Device::Cpu));
        let tokenizer = Arc::new(TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap());
        Transcriber::new(model, tokenizer)
    }

    #[test]
    fn silence_decodes_every_available_position() {
        let t = transcriber();
        let samples = vec![0f32; mel::SAMPLE_RATE];
        let out = t
            .transcribe(&samples, &TranscribeOptions::default())
            .unwrap();
        // Zero weights decode to the <unk> special everywhere, which
        // renders as empty text; the loop still has to walk every
        // available audio position past the prompt.
        assert!(out.text.is_empty());
        assert_eq!(out.stats.decoded_tokens, 24);
    }

    #[test]
    fn max_new_tokens_bounds_the_loop() {
        let t = transcriber();
        let samples = vec![0f32; mel::SAMPLE_RATE];
        let opts = TranscribeOptions {
            max_new_tokens: 5,
            ..Default::default()
        };
        let out = t.transcribe(&samples, &opts).unwrap();
        assert_eq!(out.stats.decoded_tokens, 5);
    }
}
