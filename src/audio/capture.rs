//! Microphone capture via cpal.
//!
//! Captured audio is downmixed to mono, resampled to 16 kHz, and delivered
//! as fixed-size chunks through a bounded channel. When the consumer falls
//! behind the configured backlog, incoming chunks are dropped so the
//! session never transcribes stale audio.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audio::{resample_linear, TARGET_SAMPLE_RATE};
use crate::error::{Error, Result};

const TOKEN_DURATION_MS: u64 = 80;

/// Live microphone source streaming 16 kHz mono chunks.
pub struct MicSource {
    stream: Option<Stream>,
}

impl MicSource {
    /// Open the default input device and start capturing.
    ///
    /// `chunk_samples` is the delivery granularity at 16 kHz;
    /// `max_backlog_ms` bounds the channel depth in audio time.
    pub fn start(
        chunk_samples: usize,
        max_backlog_ms: u64,
    ) -> Result<(Self, mpsc::Receiver<Vec<f32>>)> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            Error::UnsupportedAudioFormat("no default input device".to_string())
        })?;
        let config = device.default_input_config().map_err(|e| {
            Error::UnsupportedAudioFormat(format!("input config: {e}"))
        })?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let sample_format = config.sample_format();
        info!(
            device = device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            format = ?sample_format,
            "audio device configured"
        );

        // Backlog in chunks, via the 80 ms audio token duration.
        let chunk_ms =
            (chunk_samples as u64 * 1000 / TARGET_SAMPLE_RATE as u64).max(TOKEN_DURATION_MS);
        let capacity = (max_backlog_ms / chunk_ms).max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);

        let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
        let stream_config: StreamConfig = config.into();
        let err_fn = |err: cpal::StreamError| {
            error!("audio stream error: {err}");
        };

        macro_rules! build_stream {
            ($ty:ty, $to_f32:expr) => {{
                let buffer = Arc::clone(&buffer);
                let tx = tx.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[$ty], _: &cpal::InputCallbackInfo| {
                        let float: Vec<f32> = data.iter().map($to_f32).collect();
                        deliver(
                            &float,
                            channels,
                            sample_rate,
                            chunk_samples,
                            &buffer,
                            &tx,
                        );
                    },
                    err_fn,
                    None,
                )
            }};
        }

        let stream = match sample_format {
            SampleFormat::F32 => build_stream!(f32, |&s| s),
            SampleFormat::I16 => build_stream!(i16, |&s| s as f32 / i16::MAX as f32),
            SampleFormat::I32 => build_stream!(i32, |&s| s as f32 / i32::MAX as f32),
            format => {
                return Err(Error::UnsupportedAudioFormat(format!(
                    "input sample format {format:?}"
                )))
            }
        }
        .map_err(|e| Error::UnsupportedAudioFormat(format!("input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| Error::UnsupportedAudioFormat(format!("stream start: {e}")))?;
        info!(chunk_samples, capacity, "audio capture started");

        Ok((
            Self {
                stream: Some(stream),
            },
            rx,
        ))
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("audio capture stopped");
        }
    }
}

impl Drop for MicSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Downmix, resample and re-chunk one capture callback's worth of samples.
fn deliver(
    data: &[f32],
    channels: usize,
    sample_rate: u32,
    chunk_samples: usize,
    buffer: &Arc<Mutex<Vec<f32>>>,
    tx: &mpsc::Sender<Vec<f32>>,
) {
    let mono: Vec<f32> = if channels == 1 {
        data.to_vec()
    } else {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    let resampled = resample_linear(&mono, sample_rate, TARGET_SAMPLE_RATE);

    let Ok(mut buf) = buffer.lock() else {
        return;
    };
    buf.extend_from_slice(&resampled);
    while buf.len() >= chunk_samples {
        let chunk: Vec<f32> = buf.drain(..chunk_samples).collect();
        if tx.try_send(chunk).is_err() {
            warn!("audio chunk dropped: transcription not keeping up");
        }
    }
}
