//! Model hyperparameters, deserialized from `params.json` (original
//! checkpoints) or `config.json` (converted checkpoints). Both formats use
//! the same snake_case schema; converted files may additionally carry a
//! top-level `quantization` section.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AudioEncodingConfig {
    pub sampling_rate: usize,
    pub frame_rate: f64,
    pub num_mel_bins: usize,
    pub hop_length: usize,
    pub window_size: usize,
    pub global_log_mel_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub audio_encoding_args: AudioEncodingConfig,
    pub dim: usize,
    pub n_layers: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub rope_theta: f64,
    pub sliding_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownsampleConfig {
    pub downsample_factor: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperModelConfig {
    pub encoder_args: EncoderConfig,
    pub downsample_args: DownsampleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultimodalConfig {
    pub whisper_model_args: WhisperModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    pub group_size: usize,
    pub bits: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub dim: usize,
    pub n_layers: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub rope_theta: f64,
    pub norm_eps: f64,
    pub vocab_size: usize,
    pub sliding_window: usize,
    pub ada_rms_norm_t_cond_dim: usize,
    pub multimodal: MultimodalConfig,
    #[serde(default)]
    pub quantization: Option<QuantizationConfig>,
}

impl ModelConfig {
    pub fn encoder(&self) -> &EncoderConfig {
        &self.multimodal.whisper_model_args.encoder_args
    }

    pub fn downsample_factor(&self) -> usize {
        self.multimodal.whisper_model_args.downsample_args.downsample_factor
    }

    /// PCM samples per decoder position: one 80 ms audio token at 16 kHz.
    /// Hop length times the stride of the second encoder conv times the
    /// adapter downsample factor.
    pub fn samples_per_token(&self) -> usize {
        self.encoder().audio_encoding_args.hop_length * 2 * self.downsample_factor()
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> ModelConfig {
    // Small dimensions for shape tests; mirrors the real config layout.
    let json = serde_json::json!({
        "dim": 16,
        "n_layers": 2,
        "head_dim": 4,
        "hidden_dim": 32,
        "n_heads": 4,
        "n_kv_heads": 2,
        "rope_theta": 10000.0,
        "norm_eps": 1e-5,
        "vocab_size": 32,
        "sliding_window": 64,
        "ada_rms_norm_t_cond_dim": 8,
        "multimodal": {
            "whisper_model_args": {
                "encoder_args": {
                    "audio_encoding_args": {
                        "sampling_rate": 16000,
                        "frame_rate": 12.5,
                        "num_mel_bins": 128,
                        "hop_length": 160,
                        "window_size": 400,
                        "global_log_mel_max": 1.5
                    },
                    "dim": 8,
                    "n_layers": 2,
                    "head_dim": 4,
                    "hidden_dim": 16,
                    "n_heads": 2,
                    "rope_theta": 10000.0,
                    "sliding_window": 32
                },
                "downsample_args": { "downsample_factor": 4 }
            }
        }
    });
    serde_json::from_value(json).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_per_token_is_80ms_at_16k() {
        let cfg = tiny_config();
        assert_eq!(cfg.samples_per_token(), 1280);
    }

    #[test]
    fn quantization_section_is_optional() {
        let cfg = tiny_config();
        assert!(cfg.quantization.is_none());
    }
}
