//! Building blocks shared by the audio encoder and the language decoder.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

/// Traditional rotary position embedding: interleaved `(even, odd)` feature
/// pairs are rotated by position-dependent angles. Positions are absolute
/// and supplied by the KV cache offset, so keys keep their phase after the
/// sliding window starts evicting old entries.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Self {
        let half = head_dim / 2;
        let inv_freq = (0..half)
            .map(|i| (theta as f32).powf(-(i as f32) / half as f32))
            .collect();
        Self { inv_freq }
    }

    /// Rotate `q` and `k` (shape `(b, h, t, d)`) starting at `offset`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let t = q.dim(2)?;
        let half = self.inv_freq.len();
        let mut cos = Vec::with_capacity(t * half);
        let mut sin = Vec::with_capacity(t * half);
        for pos in offset..offset + t {
            for &f in &self.inv_freq {
                let angle = pos as f32 * f;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        let device = q.device();
        let cos = Tensor::from_vec(cos, (t, half), device)?.to_dtype(q.dtype())?;
        let sin = Tensor::from_vec(sin, (t, half), device)?.to_dtype(q.dtype())?;
        let q = candle_nn::rotary_emb::rope_i(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope_i(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`, all unbiased.
#[derive(Debug, Clone)]
pub struct SwiGlu {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl SwiGlu {
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(dim, hidden_dim, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(dim, hidden_dim, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(hidden_dim, dim, vb.pp("down_proj"))?,
        })
    }
}

impl Module for SwiGlu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.silu()?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Additive causal mask for a `t`-position query block over a cache view of
/// `kv_len` positions whose trailing `t` entries are the queries themselves.
/// Earlier cached positions are always visible.
pub fn causal_mask(t: usize, kv_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    debug_assert!(kv_len >= t);
    let past = kv_len - t;
    let mut data = vec![0f32; t * kv_len];
    for i in 0..t {
        for j in past + i + 1..kv_len {
            data[i * kv_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (t, kv_len), device)?.to_dtype(dtype)
}

/// Expand grouped-query keys/values so each query head has a matching
/// key/value head. Consecutive query heads share one KV head.
pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        Ok(xs)
    } else {
        let (b, n_kv, t, d) = xs.dims4()?;
        Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((b, n_kv * n_rep, t, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_lets_queries_see_all_past() {
        let mask = causal_mask(2, 5, DType::F32, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        // Three cached positions plus the query itself are visible.
        assert_eq!(rows[0][..4], [0.0, 0.0, 0.0, 0.0]);
        assert!(rows[0][4].is_infinite());
        assert!(rows[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn rope_at_offset_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 10000.0);
        let q = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 1, 4), &Device::Cpu).unwrap();
        let (q2, _) = rope.apply(&q, &q, 0).unwrap();
        let out: Vec<f32> = q2.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn repeat_kv_duplicates_heads_in_groups() {
        let xs = Tensor::from_vec(vec![1f32, 2.0], (1, 2, 1, 1), &Device::Cpu).unwrap();
        let out = repeat_kv(xs, 2).unwrap();
        assert_eq!(out.dims(), [1, 4, 1, 1]);
        let flat: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![1.0, 1.0, 2.0, 2.0]);
    }
}
