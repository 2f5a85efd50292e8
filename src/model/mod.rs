//! Voxtral model: audio encoder, downsample adapter and language decoder.

pub mod cache;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod load;

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tracing::info;

use crate::error::Result;

pub use cache::RotatingKvCache;
pub use config::ModelConfig;
pub use decoder::TextDecoder;
pub use encoder::{AudioEncoder, EncoderState};

/// Prefer an accelerator when one was compiled in; fall back to CPU.
pub fn detect_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}

pub struct VoxtralModel {
    pub encoder: AudioEncoder,
    pub decoder: TextDecoder,
    pub config: ModelConfig,
    pub device: Device,
}

impl VoxtralModel {
    /// Load a model from a resolved directory (original or converted
    /// checkpoint layout).
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let start = std::time::Instant::now();
        let paths = load::locate(dir)?;
        let config = load::load_config(&paths)?;
        let tensors = load::load_tensors(&paths, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        let encoder = AudioEncoder::new(&config, vb.clone())?;
        let decoder = TextDecoder::new(&config, vb)?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            dir = %dir.display(),
            "model loaded"
        );
        Ok(Self {
            encoder,
            decoder,
            config,
            device: device.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) fn tiny_model(device: &Device) -> VoxtralModel {
    let config = config::tiny_config();
    let vb = VarBuilder::zeros(DType::F32, device);
    VoxtralModel {
        encoder: AudioEncoder::new(&config, vb.clone()).unwrap(),
        decoder: TextDecoder::new(&config, vb).unwrap(),
        config,
        device: device.clone(),
    }
}
