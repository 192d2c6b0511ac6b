//! Speak text on the local audio device, printing each word as it is heard.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use server::translator_from_env;
use tts_core::{
    AudioOutput, ConsoleWords, HttpSpeechProvider, MonotonicClock, Pipeline, PipelineConfig,
    PlaybackSynchronizer, RunOptions, TextOnlyOutput,
};

/// Speak text aloud with word-by-word display
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text to speak. Read from standard input when omitted
    text: Vec<String>,

    /// Read the text from a file
    #[arg(short, long, conflicts_with = "text")]
    file: Option<PathBuf>,

    /// Voice identifier passed to the speech provider
    #[arg(short, long)]
    voice: Option<String>,

    /// Translate to this language before speaking
    #[arg(short, long)]
    language: Option<String>,

    /// Show the words without playing audio
    #[arg(long)]
    silent: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Words go to stdout, so logs stay on stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let _ = dotenv::dotenv();
    let args = Args::parse();

    let text = read_text(&args)?;
    if text.trim().is_empty() {
        anyhow::bail!("nothing to speak");
    }

    let config = PipelineConfig::from_env();
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("cannot create output directory {}", config.output_dir.display())
    })?;
    let provider = HttpSpeechProvider::from_env().context("speech provider is not configured")?;

    let tick = config.playback_tick;
    let delimiter = config.synthesis.delimiter.clone();
    let mut pipeline = Pipeline::new(config, Arc::new(provider));
    if let Some(translator) = translator_from_env() {
        pipeline = pipeline.with_translator(translator);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping after the current unit");
            let _ = stop_tx.send(true);
        }
    });

    let options = RunOptions {
        voice: args.voice,
        language: args.language,
    };
    let silent = args.silent;
    let outcome = pipeline
        .run_local(&text, &options, stop_rx, move || {
            let output = if silent {
                Box::new(TextOnlyOutput) as Box<dyn AudioOutput>
            } else {
                device_output().unwrap_or_else(|| Box::new(TextOnlyOutput))
            };
            PlaybackSynchronizer::new(output, MonotonicClock::default(), ConsoleWords, tick, delimiter)
        })
        .await?;

    eprintln!(
        "{} of {} unit(s) spoken, {} failed{}",
        outcome.successful,
        outcome.total,
        outcome.failed,
        if outcome.stopped { ", stopped" } else { "" }
    );
    Ok(())
}

fn read_text(args: &Args) -> anyhow::Result<String> {
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()));
    }
    if !args.text.is_empty() {
        return Ok(args.text.join(" "));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("cannot read standard input")?;
    Ok(text)
}

#[cfg(feature = "playback")]
fn device_output() -> Option<Box<dyn AudioOutput>> {
    match tts_core::RodioOutput::try_default() {
        Ok(output) => Some(Box::new(output)),
        Err(e) => {
            warn!("No audio device ({e}), showing text only");
            None
        }
    }
}

#[cfg(not(feature = "playback"))]
fn device_output() -> Option<Box<dyn AudioOutput>> {
    warn!("Built without the playback feature, showing text only");
    None
}
