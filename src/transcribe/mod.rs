//! One-shot and realtime transcription pipelines.

pub mod offline;
pub mod realtime;

pub use offline::{TranscribeOptions, Transcriber, Transcription, TranscriptionStats};
pub use realtime::{RealtimeOptions, RealtimeSession};
