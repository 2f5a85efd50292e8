//! Rotating key/value cache bounded by a sliding window.
//!
//! Two update paths cover the two decoding regimes. Multi-position prefill
//! goes through a concat path that first rewrites the buffer into temporal
//! order, so causal masks stay valid. One-token decode goes through an
//! in-place path that writes into a circular buffer without allocating per
//! step; the returned view is then rotated, which is fine because single
//! queries attend without a mask and attention is permutation-invariant
//! over cached positions.
//!
//! Readers must always go through [`RotatingKvCache::update_and_fetch`];
//! the raw buffers are not temporally ordered between calls.

use candle_core::{Result, Tensor};

const ALLOC_STEP: usize = 256;

/// Lifecycle of the circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachePhase {
    /// Nothing allocated yet.
    Empty,
    /// Below `max_size`: storage grows, nothing is evicted, and the valid
    /// region is the prefix `[0..idx]` in temporal order.
    Growing,
    /// At capacity: a circular buffer described by `(idx, offset)`.
    Full,
}

#[derive(Debug, Clone)]
pub struct RotatingKvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    /// Total positions ever appended.
    offset: usize,
    /// Logical write head into the circular buffer.
    idx: usize,
    max_size: usize,
}

impl RotatingKvCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            k: None,
            v: None,
            offset: 0,
            idx: 0,
            max_size,
        }
    }

    /// Total number of positions appended so far; also the rotary position
    /// of the next incoming token.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
        self.offset = 0;
        self.idx = 0;
    }

    fn phase(&self) -> CachePhase {
        if self.k.is_none() {
            CachePhase::Empty
        } else if self.offset < self.max_size {
            CachePhase::Growing
        } else {
            CachePhase::Full
        }
    }

    /// Append `new_k` / `new_v` (time on axis 2) and return a coherent view
    /// of the cached keys and values.
    pub fn update_and_fetch(&mut self, new_k: &Tensor, new_v: &Tensor) -> Result<(Tensor, Tensor)> {
        if new_k.dim(2)? > 1 {
            self.concat_update(new_k, new_v)
        } else {
            self.step_update(new_k, new_v)
        }
    }

    /// Valid cached region rewritten into strict temporal order.
    fn ordered(&self, data: &Tensor) -> Result<Tensor> {
        let len = data.dim(2)?;
        match self.phase() {
            // The segment at and after the write head is oldest.
            CachePhase::Full if self.idx < len => {
                let tail = data.narrow(2, self.idx, len - self.idx)?;
                let head = data.narrow(2, 0, self.idx)?;
                Tensor::cat(&[&tail, &head], 2)
            }
            _ => data.narrow(2, 0, self.idx),
        }
    }

    fn concat_update(&mut self, new_k: &Tensor, new_v: &Tensor) -> Result<(Tensor, Tensor)> {
        let t = new_k.dim(2)?;
        let (mut k, mut v) = match (&self.k, &self.v) {
            (Some(k), Some(v)) => {
                let k = self.ordered(k)?;
                let v = self.ordered(v)?;
                (
                    Tensor::cat(&[&k, new_k], 2)?,
                    Tensor::cat(&[&v, new_v], 2)?,
                )
            }
            _ => (new_k.clone(), new_v.clone()),
        };

        let len = k.dim(2)?;
        if len > self.max_size {
            k = k.narrow(2, len - self.max_size, self.max_size)?;
            v = v.narrow(2, len - self.max_size, self.max_size)?;
        }
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        self.idx = k.dim(2)?;
        self.offset += t;
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    fn step_update(&mut self, new_k: &Tensor, new_v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (mut k, mut v) = match (self.k.take(), self.v.take()) {
            (Some(k), Some(v)) => (k, v),
            _ => {
                let mut dims = new_k.dims().to_vec();
                dims[2] = ALLOC_STEP.min(self.max_size);
                self.idx = 0;
                (
                    Tensor::zeros(dims.clone(), new_k.dtype(), new_k.device())?,
                    Tensor::zeros(dims, new_v.dtype(), new_v.device())?,
                )
            }
        };

        let len = k.dim(2)?;
        if self.idx == len && len < self.max_size {
            // Amortized growth: extend the allocation with zero rows.
            let grow = ALLOC_STEP.min(self.max_size - len);
            let mut dims = k.dims().to_vec();
            dims[2] = grow;
            let zk = Tensor::zeros(dims.clone(), k.dtype(), k.device())?;
            let zv = Tensor::zeros(dims, v.dtype(), v.device())?;
            k = Tensor::cat(&[&k, &zk], 2)?;
            v = Tensor::cat(&[&v, &zv], 2)?;
        } else if len > self.max_size {
            k = k.narrow(2, len - self.max_size, self.max_size)?.contiguous()?;
            v = v.narrow(2, len - self.max_size, self.max_size)?.contiguous()?;
            self.idx = self.max_size;
        }

        if self.idx == self.max_size {
            self.idx = 0;
        }
        k.slice_set(new_k, 2, self.idx)?;
        v.slice_set(new_v, 2, self.idx)?;
        self.idx += 1;
        self.offset += 1;

        let len = k.dim(2)?;
        // Full once offset reaches the window: expose the whole buffer.
        // While growing, only the appended prefix is valid.
        let view_len = if self.offset >= self.max_size {
            len
        } else {
            self.offset.min(len)
        };
        let (out_k, out_v) = if view_len == len {
            (k.clone(), v.clone())
        } else {
            (k.narrow(2, 0, view_len)?, v.narrow(2, 0, view_len)?)
        };

        self.k = Some(k);
        self.v = Some(v);
        Ok((out_k, out_v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn kv(values: &[f32]) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let t = values.len();
        let k = Tensor::from_vec(values.to_vec(), (1, 1, t, 1), &device).unwrap();
        let v = Tensor::from_vec(
            values.iter().map(|x| x * 10.0).collect::<Vec<_>>(),
            (1, 1, t, 1),
            &device,
        )
        .unwrap();
        (k, v)
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    /// Rebuild temporal order from a (possibly rotated) full view.
    fn in_temporal_order(view: &[f32], cache: &RotatingKvCache) -> Vec<f32> {
        if cache.offset() < cache.max_size() {
            return view.to_vec();
        }
        let idx = cache.idx;
        let mut out = Vec::with_capacity(view.len());
        out.extend_from_slice(&view[idx..]);
        out.extend_from_slice(&view[..idx]);
        out
    }

    #[test]
    fn single_token_updates_rotate_within_window() {
        let mut cache = RotatingKvCache::new(4);
        let mut key_view = Vec::new();
        let mut value_view = Vec::new();
        for i in 1..=5 {
            let (k, v) = kv(&[i as f32]);
            let (kc, vc) = cache.update_and_fetch(&k, &v).unwrap();
            key_view = flat(&kc);
            value_view = flat(&vc);
        }
        assert_eq!(cache.offset(), 5);
        assert_eq!(key_view, vec![5.0, 2.0, 3.0, 4.0]);
        assert_eq!(value_view, vec![50.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn prefill_then_single_tokens() {
        let mut cache = RotatingKvCache::new(4);
        let (k, v) = kv(&[1.0, 2.0, 3.0]);
        let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
        assert_eq!(flat(&kc), vec![1.0, 2.0, 3.0]);

        let (k, v) = kv(&[4.0]);
        let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
        assert_eq!(flat(&kc), vec![1.0, 2.0, 3.0, 4.0]);

        let (k, v) = kv(&[5.0]);
        let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
        assert_eq!(cache.offset(), 5);
        assert_eq!(flat(&kc), vec![5.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn long_prefill_keeps_last_window_in_order() {
        let mut cache = RotatingKvCache::new(4);
        let values: Vec<f32> = (1..=10).map(|i| i as f32).collect();
        let (k, v) = kv(&values);
        let (kc, vc) = cache.update_and_fetch(&k, &v).unwrap();
        assert_eq!(cache.offset(), 10);
        assert_eq!(flat(&kc), vec![7.0, 8.0, 9.0, 10.0]);
        assert_eq!(flat(&vc), vec![70.0, 80.0, 90.0, 100.0]);
    }

    #[test]
    fn growth_is_amortized_for_long_single_token_runs() {
        // Window larger than one allocation step: growth happens in
        // ALLOC_STEP slabs while the view only exposes appended rows.
        let mut cache = RotatingKvCache::new(300);
        for i in 1..=260 {
            let (k, v) = kv(&[i as f32]);
            let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
            assert_eq!(kc.dim(2).unwrap(), i);
        }
        assert_eq!(cache.offset(), 260);
    }

    #[test]
    fn round_trip_prefill_and_decode_overflow() {
        let max = 6;
        let mut cache = RotatingKvCache::new(max);
        let prefill: Vec<f32> = (1..=5).map(|i| i as f32).collect();
        let (k, v) = kv(&prefill);
        cache.update_and_fetch(&k, &v).unwrap();

        let mut last = Vec::new();
        for i in 6..=13 {
            let (k, v) = kv(&[i as f32]);
            let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
            last = flat(&kc);
        }
        assert_eq!(cache.offset(), 13);
        assert_eq!(last.len(), max);
        let ordered = in_temporal_order(&last, &cache);
        assert_eq!(ordered, vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut cache = RotatingKvCache::new(4);
        let (k, v) = kv(&[1.0, 2.0]);
        cache.update_and_fetch(&k, &v).unwrap();
        cache.reset();
        assert_eq!(cache.offset(), 0);
        let (k, v) = kv(&[9.0]);
        let (kc, _) = cache.update_and_fetch(&k, &v).unwrap();
        assert_eq!(flat(&kc), vec![9.0]);
    }
}
