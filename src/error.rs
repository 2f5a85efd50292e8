use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the transcription pipeline.
///
/// Session runtime conditions (no pending samples, buffers not yet full)
/// are not errors; those paths return an empty text fragment instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk duration must be positive, got {0} ms")]
    InvalidChunkDuration(i64),

    #[error("tokenizer does not define the `{0}` special token")]
    MissingSpecialToken(&'static str),

    #[error("audio too short for the decoder prompt: {required} embedding rows required, {available} available")]
    AudioTooShortForPrompt { required: usize, available: usize },

    #[error("unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("failed to read audio from {}: {reason}", .path.display())]
    FailedToReadAudio { path: PathBuf, reason: String },

    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),

    #[error("invalid model spec `{0}`")]
    InvalidModelSpec(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hub(#[from] hf_hub::api::sync::ApiError),
}

pub type Result<T> = std::result::Result<T, Error>;
