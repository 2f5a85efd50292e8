use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use voxtral_rt::audio::capture::MicSource;
use voxtral_rt::audio::load_audio;
use voxtral_rt::model::{detect_device, load::resolve_model, VoxtralModel};
use voxtral_rt::tokenizer::TekkenTokenizer;
use voxtral_rt::transcribe::{
    RealtimeOptions, RealtimeSession, TranscribeOptions, Transcriber,
};

#[derive(Parser)]
#[command(name = "voxtral-rt")]
#[command(about = "Voxtral speech-to-text: offline files and live microphone streaming")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe an audio file in one shot.
    Transcribe {
        /// Path to the audio file.
        #[arg(long)]
        audio: PathBuf,

        /// Model directory or Hugging Face repo id.
        #[arg(long)]
        model: String,

        /// Sampling temperature; 0 means greedy.
        #[arg(long, default_value_t = 0.0)]
        temp: f64,

        #[arg(long, default_value_t = 1024)]
        max_new_tokens: usize,

        /// Print timing statistics after the transcript.
        #[arg(long)]
        stats: bool,
    },

    /// Transcribe the default microphone live.
    Live {
        /// Model directory or Hugging Face repo id.
        #[arg(long)]
        model: String,

        /// Sampling temperature; 0 means greedy.
        #[arg(long, default_value_t = 0.0)]
        temp: f64,

        /// Audio chunk duration fed to the session per step.
        #[arg(long, default_value_t = 80)]
        chunk_ms: i64,

        /// Override the model's transcription delay.
        #[arg(long)]
        transcription_delay_ms: Option<u64>,

        /// Trailing silence tokens used to flush the stream at shutdown.
        #[arg(long, default_value_t = 17)]
        right_pad_tokens: usize,

        /// Decoder KV window in tokens (clamped to at least 256).
        #[arg(long)]
        decoder_window: Option<usize>,

        /// Drop captured audio older than this backlog.
        #[arg(long, default_value_t = 5000)]
        max_backlog_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Transcribe {
            audio,
            model,
            temp,
            max_new_tokens,
            stats,
        } => transcribe_file(audio, model, temp, max_new_tokens, stats),
        Command::Live {
            model,
            temp,
            chunk_ms,
            transcription_delay_ms,
            right_pad_tokens,
            decoder_window,
            max_backlog_ms,
        } => {
            live(
                model,
                RealtimeOptions {
                    temperature: temp,
                    chunk_duration_ms: chunk_ms,
                    transcription_delay_ms,
                    right_pad_tokens,
                    decoder_window_tokens: decoder_window,
                },
                max_backlog_ms,
            )
            .await
        }
    }
}

fn load_model(spec: &str) -> Result<(Arc<VoxtralModel>, Arc<TekkenTokenizer>)> {
    let dir = resolve_model(spec).context("failed to resolve model")?;
    let tokenizer =
        TekkenTokenizer::from_file(&dir.join("tekken.json")).context("failed to load tokenizer")?;
    let device = detect_device();
    let model = VoxtralModel::load(&dir, &device).context("failed to load model")?;
    Ok((Arc::new(model), Arc::new(tokenizer)))
}

fn transcribe_file(
    audio: PathBuf,
    model_spec: String,
    temp: f64,
    max_new_tokens: usize,
    stats: bool,
) -> Result<()> {
    let (model, tokenizer) = load_model(&model_spec)?;
    let samples = load_audio(&audio).context("failed to load audio")?;

    let transcriber = Transcriber::new(model, tokenizer);
    let result = transcriber.transcribe(
        &samples,
        &TranscribeOptions {
            temperature: temp,
            max_new_tokens,
        },
    )?;

    println!("{}", result.text);
    if stats {
        eprintln!(
            "audio: {:.2}s  wall: {:.2}s  tokens: {}  rtf: {}",
            result.stats.audio_secs,
            result.stats.elapsed.as_secs_f64(),
            result.stats.decoded_tokens,
            result
                .stats
                .real_time_factor()
                .map_or_else(|| "n/a".to_string(), |rtf| format!("{rtf:.3}")),
        );
    }
    Ok(())
}

async fn live(model_spec: String, opts: RealtimeOptions, max_backlog_ms: u64) -> Result<()> {
    let (model, tokenizer) = load_model(&model_spec)?;
    let mut session = RealtimeSession::new(model, tokenizer, opts)?;

    // Capture at one audio token per delivery; the session re-chunks
    // internally anyway.
    let (mut mic, mut chunks) = MicSource::start(1280, max_backlog_ms)?;
    info!("listening; press Ctrl+C to stop");

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                let fragment = session.append_audio_samples(&chunk)?;
                if !fragment.is_empty() {
                    write!(stdout, "{fragment}")?;
                    stdout.flush()?;
                }
            }
        }
    }

    mic.stop();
    let tail = session.finish_stream()?;
    if !tail.is_empty() {
        write!(stdout, "{tail}")?;
    }
    writeln!(stdout)?;
    stdout.flush()?;
    info!("session closed");
    Ok(())
}
