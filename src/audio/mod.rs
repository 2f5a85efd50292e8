//! Audio input: file decoding and microphone capture, both normalized to
//! 16 kHz mono f32 PCM before entering the transcription pipeline.

pub mod capture;
pub mod mel;

use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{info, trace};

use crate::error::{Error, Result};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decode an audio file to 16 kHz mono f32 samples. Multichannel input is
/// downmixed by averaging; other sample rates are linearly resampled.
pub fn load_audio(path: &Path) -> Result<Vec<f32>> {
    let file = std::fs::File::open(path).map_err(|e| Error::FailedToReadAudio {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::UnsupportedAudioFormat(format!("{}: {e}", path.display())))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::UnsupportedAudioFormat(format!("{}: no audio track", path.display())))?;
    let sample_rate = track.codec_params.sample_rate.ok_or_else(|| {
        Error::UnsupportedAudioFormat(format!("{}: unknown sample rate", path.display()))
    })?;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::UnsupportedAudioFormat(format!("{}: {e}", path.display())))?;

    let mut pcm = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                trace!("skipping undecodable packet: {e}");
                continue;
            }
        };
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        let samples = buf.samples();
        if channels > 1 {
            pcm.extend(
                samples
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        } else {
            pcm.extend_from_slice(samples);
        }
    }

    if pcm.is_empty() {
        return Err(Error::FailedToReadAudio {
            path: path.to_path_buf(),
            reason: "no decodable audio".to_string(),
        });
    }

    let pcm = if sample_rate != TARGET_SAMPLE_RATE {
        resample_linear(&pcm, sample_rate, TARGET_SAMPLE_RATE)
    } else {
        pcm
    };
    info!(
        path = %path.display(),
        secs = pcm.len() as f64 / TARGET_SAMPLE_RATE as f64,
        "audio loaded"
    );
    Ok(pcm)
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 / ratio;
        let i0 = pos.floor() as usize;
        let i1 = (i0 + 1).min(samples.len() - 1);
        let frac = (pos - i0 as f64) as f32;
        out.push(samples[i0] * (1.0 - frac) + samples[i1] * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_is_identity_at_same_rate() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn resample_halves_length_from_32k() {
        let samples = vec![0.5f32; 3200];
        let out = resample_linear(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn resample_preserves_silence() {
        let out = resample_linear(&vec![0f32; 4410], 44_100, 16_000);
        assert!(!out.is_empty());
        assert!(out.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = load_audio(Path::new("/nonexistent/clip.wav")).unwrap_err();
        assert!(matches!(err, Error::FailedToReadAudio { .. }));
    }
}
