//! Log-mel spectrogram frontend.
//!
//! Two entry points share the same per-frame math: [`log_mel_offline`]
//! reflect-pads the whole clip the way the feature extractor does for file
//! transcription, while [`log_mel_step`] consumes audio incrementally and
//! carries the trailing samples of each call as tail state so that a live
//! stream can be windowed without re-reading earlier PCM.
//!
//! The DFT and mel-filter projections are matrix products against
//! precomputed tables, so the whole frame batch runs through the tensor
//! backend instead of per-bin scalar loops.

use candle_core::{Device, Result, Tensor};
use once_cell::sync::Lazy;

pub const SAMPLE_RATE: usize = 16_000;
pub const N_FFT: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const N_MELS: usize = 128;
pub const N_FREQS: usize = N_FFT / 2 + 1;

/// Fixed spectrogram ceiling used by the Voxtral feature extractor; values
/// are clamped below at `GLOBAL_LOG_MEL_MAX - 8.0` before rescaling.
pub const GLOBAL_LOG_MEL_MAX: f32 = 1.5;

/// Samples retained between incremental steps: one window minus one hop.
pub const TAIL_SAMPLES: usize = N_FFT - HOP_LENGTH;

/// Precomputed Hann window, DFT matrices and mel filter bank, held as
/// tensors so the per-frame projections are plain matmuls.
///
/// Read-only and cheap to build; shared process-wide.
struct MelTables {
    /// `(N_FFT,)`.
    hann: Tensor,
    /// `(N_FREQS, N_FFT)`.
    dft_real: Tensor,
    dft_imag: Tensor,
    /// `(N_MELS, N_FREQS)`.
    filters: Tensor,
}

static TABLES: Lazy<MelTables> = Lazy::new(|| {
    let cpu = Device::Cpu;
    MelTables {
        hann: Tensor::from_vec(hann_window(), N_FFT, &cpu).expect("hann window"),
        dft_real: Tensor::from_vec(dft_matrix(false), (N_FREQS, N_FFT), &cpu)
            .expect("dft real matrix"),
        dft_imag: Tensor::from_vec(dft_matrix(true), (N_FREQS, N_FFT), &cpu)
            .expect("dft imag matrix"),
        filters: Tensor::from_vec(mel_filter_bank(), (N_MELS, N_FREQS), &cpu)
            .expect("mel filter bank"),
    }
});

/// Hann(n_fft + 1) with the last point dropped, i.e. the periodic window.
fn hann_window() -> Vec<f32> {
    (0..N_FFT)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / N_FFT as f32).cos())
        .collect()
}

fn dft_matrix(imag: bool) -> Vec<f32> {
    let mut m = vec![0f32; N_FREQS * N_FFT];
    for k in 0..N_FREQS {
        for n in 0..N_FFT {
            let angle = -2.0 * std::f64::consts::PI * (k * n) as f64 / N_FFT as f64;
            m[k * N_FFT + n] = if imag { angle.sin() } else { angle.cos() } as f32;
        }
    }
    m
}

/// Whisper-style piecewise Hz-to-mel map: linear below 1 kHz, log above.
fn hz_to_mel(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let log_step = 6.4f64.ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / log_step
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_mel = 1000.0 / f_sp;
    let log_step = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        1000.0 * (log_step * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Triangular filters over `[0, 8000]` Hz with per-filter area
/// normalization `2 / (right - left)`.
fn mel_filter_bank() -> Vec<f32> {
    let f_max = SAMPLE_RATE as f64 / 2.0;
    let mel_max = hz_to_mel(f_max);
    let hz_points: Vec<f64> = (0..N_MELS + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (N_MELS + 1) as f64))
        .collect();

    let mut filters = vec![0f32; N_MELS * N_FREQS];
    for m in 0..N_MELS {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for k in 0..N_FREQS {
            let freq = k as f64 * SAMPLE_RATE as f64 / N_FFT as f64;
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[m * N_FREQS + k] = (weight * enorm) as f32;
        }
    }
    filters
}

/// Compute `n_frames` mel frames from `samples` at hop-aligned offsets.
///
/// The hop-strided frames are windowed, pushed through the real/imaginary
/// DFT matrices, projected onto the mel filter bank, then log-scaled and
/// rescaled. Output is frame-major `(n_frames, N_MELS)`.
fn mel_frames(samples: &[f32], n_frames: usize, device: &Device) -> Result<Tensor> {
    let t = &*TABLES;
    let mut frames = Vec::with_capacity(n_frames * N_FFT);
    for frame in 0..n_frames {
        let start = frame * HOP_LENGTH;
        frames.extend_from_slice(&samples[start..start + N_FFT]);
    }
    let frames = Tensor::from_vec(frames, (n_frames, N_FFT), &Device::Cpu)?;
    let windowed = frames.broadcast_mul(&t.hann)?;

    let real = windowed.matmul(&t.dft_real.t()?)?;
    let imag = windowed.matmul(&t.dft_imag.t()?)?;
    let power = (real.sqr()? + imag.sqr()?)?;
    let energy = power.matmul(&t.filters.t()?)?;

    let log10 = (energy.maximum(1e-10)?.log()? / std::f64::consts::LN_10)?;
    let floor = (GLOBAL_LOG_MEL_MAX - 8.0) as f64;
    log10.maximum(floor)?.affine(0.25, 1.0)?.to_device(device)
}

fn empty_mel(device: &Device) -> Result<Tensor> {
    Tensor::from_vec(Vec::<f32>::new(), (N_MELS, 0), device)
}

/// Offline log-mel: reflect-pad by `n_fft / 2` on both sides, window every
/// hop, and drop the final frame. Returns a `(N_MELS, frames)` tensor.
pub fn log_mel_offline(samples: &[f32], device: &Device) -> Result<Tensor> {
    let pad = N_FFT / 2;
    let mut padded = Vec::with_capacity(samples.len() + 2 * pad);
    for i in 0..pad {
        let idx = pad - i;
        padded.push(*samples.get(idx).unwrap_or(&0.0));
    }
    padded.extend_from_slice(samples);
    for i in 0..pad {
        let idx = samples.len().saturating_sub(2 + i);
        padded.push(*samples.get(idx).unwrap_or(&0.0));
    }

    let n_frames = if padded.len() >= N_FFT {
        1 + (padded.len() - N_FFT) / HOP_LENGTH
    } else {
        0
    };
    // The trailing frame only sees right padding.
    let n_frames = n_frames.saturating_sub(1);
    if n_frames == 0 {
        return empty_mel(device);
    }
    mel_frames(&padded, n_frames, device)?.t()?.contiguous()
}

/// Incremental log-mel step.
///
/// Prepends the tail carried from the previous call, or `n_fft / 2` zeros
/// on the very first step (the streaming stand-in for centered-STFT left
/// padding). The final frame is kept, and the trailing
/// `min(len, n_fft - hop)` samples become the next tail.
pub fn log_mel_step(
    chunk: &[f32],
    tail: Option<&[f32]>,
    device: &Device,
) -> Result<(Tensor, Vec<f32>)> {
    let mut buf: Vec<f32> = match tail {
        Some(t) => t.to_vec(),
        None => vec![0f32; N_FFT / 2],
    };
    buf.extend_from_slice(chunk);

    let n_frames = if buf.len() >= N_FFT {
        1 + (buf.len() - N_FFT) / HOP_LENGTH
    } else {
        0
    };
    let mel = if n_frames == 0 {
        empty_mel(device)?
    } else {
        mel_frames(&buf, n_frames, device)?.t()?.contiguous()?
    };

    let keep = buf.len().min(TAIL_SAMPLES);
    let new_tail = buf[buf.len() - keep..].to_vec();

    Ok((mel, new_tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, secs: f32) -> Vec<f32> {
        let n = (secs * SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn offline_shape_for_one_second_sine() {
        let device = Device::Cpu;
        let mel = log_mel_offline(&sine(440.0, 1.0), &device).unwrap();
        let (rows, cols) = mel.dims2().unwrap();
        assert_eq!(rows, N_MELS);
        assert!(cols > 0);
        // One frame per hop on a 16k-sample clip.
        assert_eq!(cols, SAMPLE_RATE / HOP_LENGTH);
    }

    #[test]
    fn filter_bank_is_nonnegative_with_active_rows() {
        let filters = mel_filter_bank();
        assert!(filters.iter().all(|&w| w >= 0.0));
        for m in 0..N_MELS {
            let row_sum: f32 = filters[m * N_FREQS..(m + 1) * N_FREQS].iter().sum();
            assert!(row_sum > 0.0, "mel filter {m} is empty");
        }
    }

    #[test]
    fn single_step_matches_offline_on_interior_frames() {
        // A whole clip fed as one incremental step shares the offline hop
        // grid; only the first frames touch the zero-vs-reflect left edge.
        let device = Device::Cpu;
        let samples = sine(440.0, 0.5);

        let offline = log_mel_offline(&samples, &device).unwrap();
        let (step, _tail) = log_mel_step(&samples, None, &device).unwrap();

        let off: Vec<f32> = offline
            .t()
            .unwrap()
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let inc: Vec<f32> = step
            .t()
            .unwrap()
            .contiguous()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let step_frames = step.dims2().unwrap().1;
        assert!(step_frames >= 3);

        for frame in 2..step_frames {
            for m in 0..N_MELS {
                let a = off[frame * N_MELS + m];
                let b = inc[frame * N_MELS + m];
                assert!(
                    (a - b).abs() < 1e-4,
                    "frame {frame} mel {m}: offline {a} vs step {b}"
                );
            }
        }
    }

    #[test]
    fn step_tail_is_window_minus_hop() {
        let device = Device::Cpu;
        let chunk = vec![0.25f32; 1280];
        let (_, tail) = log_mel_step(&chunk, None, &device).unwrap();
        assert_eq!(tail.len(), TAIL_SAMPLES);

        let (_, tail2) = log_mel_step(&chunk, Some(&tail), &device).unwrap();
        assert_eq!(tail2.len(), TAIL_SAMPLES);
    }

    #[test]
    fn short_chunk_yields_empty_tensor() {
        let device = Device::Cpu;
        // 100 samples on top of the 200-zero seed: below one window.
        let chunk = vec![0.5f32; 100];
        let (mel, tail) = log_mel_step(&chunk, None, &device).unwrap();
        assert_eq!(mel.dims2().unwrap(), (N_MELS, 0));
        // The tail is capped at one window minus one hop.
        assert_eq!(tail.len(), TAIL_SAMPLES);
    }
}
