//! Incremental audio encoder.
//!
//! Two causal 1-D convolutions feed a transformer stack whose attention
//! layers are bounded by a sliding window of cached keys/values. The conv
//! layers carry tail frames between incremental calls so a live stream sees
//! exactly the same receptive fields as a single offline pass, and the
//! downsampling adapter groups encoder frames into decoder-rate embeddings.

use candle_core::{Result, Tensor};
use candle_nn::{conv1d, linear, linear_no_bias, rms_norm, Conv1d, Conv1dConfig, Linear, Module, RmsNorm, VarBuilder};

use super::cache::RotatingKvCache;
use super::config::{EncoderConfig, ModelConfig};
use super::layers::{causal_mask, RotaryEmbedding, SwiGlu};

/// Maximum transformer chunk length; longer inputs are windowed through the
/// KV caches piecewise so attention stays bounded.
const MAX_CHUNK: usize = 256;

struct EncoderAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl EncoderAttention {
    fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.n_heads * cfg.head_dim;
        Ok(Self {
            q_proj: linear(cfg.dim, hidden, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(cfg.dim, hidden, vb.pp("k_proj"))?,
            v_proj: linear(cfg.dim, hidden, vb.pp("v_proj"))?,
            o_proj: linear(hidden, cfg.dim, vb.pp("o_proj"))?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut RotatingKvCache,
    ) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rope.apply(&q, &k, cache.offset())?;
        let (k, v) = cache.update_and_fetch(&k, &v)?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut attn = (q.matmul(&k.t()?)? * scale)?;
        if t > 1 {
            let mask = causal_mask(t, k.dim(2)?, attn.dtype(), attn.device())?;
            attn = attn.broadcast_add(&mask)?;
        }
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.n_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

struct EncoderLayer {
    attention: EncoderAttention,
    feed_forward: SwiGlu,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl EncoderLayer {
    fn new(cfg: &EncoderConfig, norm_eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: EncoderAttention::new(cfg, vb.pp("attention"))?,
            feed_forward: SwiGlu::new(cfg.dim, cfg.hidden_dim, vb.pp("feed_forward"))?,
            attention_norm: rms_norm(cfg.dim, norm_eps, vb.pp("attention_norm"))?,
            ffn_norm: rms_norm(cfg.dim, norm_eps, vb.pp("ffn_norm"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut RotatingKvCache,
    ) -> Result<Tensor> {
        let h = (x + self
            .attention
            .forward(&self.attention_norm.forward(x)?, rope, cache)?)?;
        let ff = self.feed_forward.forward(&self.ffn_norm.forward(&h)?)?;
        h + ff
    }
}

/// Two linear layers around a GELU, projecting groups of
/// `downsample_factor` encoder frames into the decoder embedding space.
pub struct DownsampleAdapter {
    w_in: Linear,
    w_out: Linear,
}

impl DownsampleAdapter {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_in: linear_no_bias(in_dim, out_dim, vb.pp("w_in"))?,
            w_out: linear_no_bias(out_dim, out_dim, vb.pp("w_out"))?,
        })
    }
}

impl Module for DownsampleAdapter {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.w_out.forward(&self.w_in.forward(xs)?.gelu_erf()?)
    }
}

/// Mutable per-stream encoder state: conv tails, one rotating cache per
/// transformer layer, and encoder rows not yet aligned on a downsample
/// group boundary.
pub struct EncoderState {
    conv1_tail: Option<Tensor>,
    conv2_tail: Option<Tensor>,
    caches: Vec<RotatingKvCache>,
    downsample_buf: Option<Tensor>,
}

impl EncoderState {
    fn new(n_layers: usize, window: usize) -> Self {
        Self {
            conv1_tail: None,
            conv2_tail: None,
            caches: (0..n_layers).map(|_| RotatingKvCache::new(window)).collect(),
            downsample_buf: None,
        }
    }

    pub fn reset(&mut self) {
        self.conv1_tail = None;
        self.conv2_tail = None;
        self.downsample_buf = None;
        for cache in &mut self.caches {
            cache.reset();
        }
    }
}

pub struct AudioEncoder {
    conv1: Conv1d,
    conv2: Conv1d,
    layers: Vec<EncoderLayer>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    adapter: DownsampleAdapter,
    dim: usize,
    out_dim: usize,
    downsample_factor: usize,
    sliding_window: usize,
}

impl AudioEncoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let enc = cfg.encoder();
        let vb_enc = vb.pp("audio_encoder");
        let conv1 = conv1d(
            enc.audio_encoding_args.num_mel_bins,
            enc.dim,
            3,
            Conv1dConfig::default(),
            vb_enc.pp("conv1"),
        )?;
        let conv2 = conv1d(
            enc.dim,
            enc.dim,
            3,
            Conv1dConfig {
                stride: 2,
                ..Default::default()
            },
            vb_enc.pp("conv2"),
        )?;
        let layers = (0..enc.n_layers)
            .map(|i| EncoderLayer::new(enc, cfg.norm_eps, vb_enc.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(enc.dim, cfg.norm_eps, vb_enc.pp("norm"))?;
        let adapter =
            DownsampleAdapter::new(cfg.downsample_factor() * enc.dim, cfg.dim, vb.pp("adapter"))?;
        Ok(Self {
            conv1,
            conv2,
            layers,
            norm,
            rope: RotaryEmbedding::new(enc.head_dim, enc.rope_theta),
            adapter,
            dim: enc.dim,
            out_dim: cfg.dim,
            downsample_factor: cfg.downsample_factor(),
            sliding_window: enc.sliding_window,
        })
    }

    pub fn new_state(&self) -> EncoderState {
        EncoderState::new(self.layers.len(), self.sliding_window)
    }

    /// Conv frontend over `(n_mels, T)` mel columns. Tails make the
    /// convolutions causal across calls; absent tails mean stream start and
    /// are replaced by explicit left padding.
    fn conv_forward(&self, mel: &Tensor, state: &mut EncoderState) -> Result<Tensor> {
        let x = mel
            .unsqueeze(0)?
            .to_dtype(self.conv1.weight().dtype())?;
        let x = match state.conv1_tail.take() {
            Some(tail) => Tensor::cat(&[&tail, &x], 2)?,
            None => x.pad_with_zeros(2, 2, 0)?,
        };
        state.conv1_tail = Some(x.narrow(2, x.dim(2)? - 2, 2)?.contiguous()?);
        let x = self.conv1.forward(&x)?.gelu_erf()?;

        let x = match state.conv2_tail.take() {
            Some(tail) => Tensor::cat(&[&tail, &x], 2)?,
            None => x.pad_with_zeros(2, 1, 0)?,
        };
        state.conv2_tail = Some(x.narrow(2, x.dim(2)? - 1, 1)?.contiguous()?);
        self.conv2.forward(&x)?.gelu_erf()
    }

    /// Run `(1, T, dim)` through the transformer in bounded chunks so each
    /// chunk attends to all earlier context within the sliding window.
    fn transform(&self, x: &Tensor, caches: &mut [RotatingKvCache]) -> Result<Tensor> {
        let total = x.dim(1)?;
        let chunk_len = MAX_CHUNK.min(self.sliding_window).max(1);
        let mut outs = Vec::new();
        let mut pos = 0;
        while pos < total {
            let len = chunk_len.min(total - pos);
            let mut h = x.narrow(1, pos, len)?.contiguous()?;
            for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
                h = layer.forward(&h, &self.rope, cache)?;
            }
            outs.push(h);
            pos += len;
        }
        let h = if outs.len() == 1 {
            outs.remove(0)
        } else {
            Tensor::cat(&outs, 1)?
        };
        self.norm.forward(&h)
    }

    fn downsample(&self, rows: &Tensor) -> Result<Tensor> {
        let groups = rows.dim(0)? / self.downsample_factor;
        let grouped = rows
            .contiguous()?
            .reshape((groups, self.downsample_factor * self.dim))?;
        self.adapter.forward(&grouped)
    }

    /// Offline encode: full mel spectrogram to audio embedding rows
    /// `(rows, decoder_dim)`.
    pub fn encode(&self, mel: &Tensor) -> Result<Tensor> {
        let (_, t) = mel.dims2()?;
        // Odd frame counts cannot survive the stride-2 conv cleanly.
        let mel = if t % 2 == 1 {
            mel.narrow(1, 1, t - 1)?
        } else {
            mel.clone()
        };
        let mut state = self.new_state();
        let x = self.conv_forward(&mel, &mut state)?;
        if x.dim(2)? == 0 {
            return Tensor::from_vec(Vec::<f32>::new(), (0, self.out_dim), x.device());
        }
        let x = x.transpose(1, 2)?.contiguous()?;
        let h = self.transform(&x, &mut state.caches)?.squeeze(0)?;

        let len = h.dim(0)?;
        let rem = len % self.downsample_factor;
        if len == rem {
            return Tensor::from_vec(Vec::<f32>::new(), (0, self.out_dim), h.device());
        }
        let h = if rem > 0 {
            h.narrow(0, rem, len - rem)?
        } else {
            h
        };
        self.downsample(&h)
    }

    /// Incremental encode. Returns the newly completed embedding rows, or
    /// `None` when no full downsample group is available yet.
    pub fn encode_step(&self, mel: &Tensor, state: &mut EncoderState) -> Result<Option<Tensor>> {
        if mel.dim(1)? == 0 {
            return Ok(None);
        }
        let x = self.conv_forward(mel, state)?;
        if x.dim(2)? == 0 {
            return Ok(None);
        }
        let x = x.transpose(1, 2)?.contiguous()?;
        let h = self.transform(&x, &mut state.caches)?.squeeze(0)?;

        let h = match state.downsample_buf.take() {
            Some(buf) => Tensor::cat(&[&buf, &h], 0)?,
            None => h,
        };
        let len = h.dim(0)?;
        let groups = len / self.downsample_factor;
        let rem = len % self.downsample_factor;
        if rem > 0 {
            state.downsample_buf = Some(
                h.narrow(0, groups * self.downsample_factor, rem)?
                    .contiguous()?,
            );
        }
        if groups == 0 {
            return Ok(None);
        }
        let head = h.narrow(0, 0, groups * self.downsample_factor)?;
        Ok(Some(self.downsample(&head)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::tiny_config;
    use candle_core::{DType, Device};

    fn tiny_encoder() -> AudioEncoder {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        AudioEncoder::new(&cfg, vb).unwrap()
    }

    fn mel_frames(n: usize) -> Tensor {
        Tensor::zeros((128, n), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn encode_step_emits_one_row_per_downsample_group() {
        let enc = tiny_encoder();
        let mut state = enc.new_state();
        // Eight mel frames -> four encoder frames -> one embedding row.
        let out = enc.encode_step(&mel_frames(8), &mut state).unwrap();
        let out = out.expect("one full group");
        assert_eq!(out.dims(), [1, 16]);
    }

    #[test]
    fn encode_step_buffers_partial_groups() {
        let enc = tiny_encoder();
        let mut state = enc.new_state();
        // Four mel frames -> two encoder frames: not enough for a group.
        assert!(enc.encode_step(&mel_frames(4), &mut state).unwrap().is_none());
        // Four more complete the group.
        let out = enc.encode_step(&mel_frames(4), &mut state).unwrap();
        assert_eq!(out.expect("group completed").dims(), [1, 16]);
    }

    #[test]
    fn offline_encode_drops_leading_remainder() {
        let enc = tiny_encoder();
        // 18 mel frames -> 9 encoder frames -> remainder 1 dropped -> 2 rows.
        let out = enc.encode(&mel_frames(18)).unwrap();
        assert_eq!(out.dims(), [2, 16]);
    }

    #[test]
    fn incremental_conv_matches_total_frame_count() {
        let enc = tiny_encoder();
        let mut state = enc.new_state();
        let mut rows = 0;
        for _ in 0..4 {
            if let Some(out) = enc.encode_step(&mel_frames(8), &mut state).unwrap() {
                rows += out.dim(0).unwrap();
            }
        }
        // 32 mel frames at stride 2 and downsample 4: four embedding rows.
        assert_eq!(rows, 4);
    }
}
