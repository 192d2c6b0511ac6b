//! Error types for the synthesis pipeline

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Session setup or bookkeeping failed. Setup failures are the only errors
/// that abort a run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create session directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not allocate a unique session directory under {0} after {1} attempts")]
    Exhausted(PathBuf, usize),

    #[error("path {0} is outside the session store")]
    OutsideStore(PathBuf),
}

/// Errors a speech synthesis provider can report for one call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("synthesis request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("synthesis provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

/// Why a single unit produced no artifact. Scoped to that unit only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SynthesisFailure {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned no audio")]
    EmptyAudio,

    #[error("failed to write artifact: {0}")]
    Io(String),

    #[error("worker panicked")]
    Panicked,

    #[error("no result was produced for this unit")]
    Missing,
}

impl From<ProviderError> for SynthesisFailure {
    fn from(err: ProviderError) -> Self {
        SynthesisFailure::Provider(err.to_string())
    }
}

/// Local playback failure for one unit. Logged, never propagated past the unit.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    Device(String),

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a whole run before any unit is delivered.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("client {0} is not connected")]
    ClientNotConnected(u64),

    #[error("nothing to synthesize")]
    EmptyText,

    #[error("synthesis failed: {0}")]
    Synthesis(SynthesisFailure),

    #[error("consumer task failed: {0}")]
    Consumer(String),
}
