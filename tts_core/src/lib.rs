//! Streaming text-to-speech pipeline.
//!
//! Text is split into units, synthesized concurrently by an external provider,
//! put back into order, and handed to one consumer: local playback with
//! word highlighting, or a remote client over a persistent connection. Every
//! file a run writes lives in its session directory and is removed with it.

pub mod boundary;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod playback;
pub mod provider;
pub mod queue;
pub mod segment;
pub mod session;
pub mod worker;

pub use boundary::WordBoundary;
pub use config::{PipelineConfig, SynthesisConfig};
pub use dispatch::{ClientRegistry, Frame, RunTicket, StreamDispatcher};
pub use error::{PipelineError, PlaybackError, ProviderError, SessionError, SynthesisFailure};
pub use pipeline::{Pipeline, RunOptions, RunOutcome, Segmentation, StreamRun};
pub use playback::{AudioOutput, ConsoleWords, MonotonicClock, PlaybackState, PlaybackSynchronizer, TextOnlyOutput};
pub use provider::{HttpSpeechProvider, SpeechOutput, SpeechProvider, TimingEvent, VoiceInfo};
pub use queue::{Delivery, OrderedDeliveryQueue, OrderedResults};
pub use segment::{segment, split_paragraphs, TextUnit};
pub use session::{FileCategory, Session, SessionFileStore};
pub use worker::{Outcome, SynthesisArtifact, SynthesisPool, SynthesisResult};

#[cfg(feature = "playback")]
pub use playback::RodioOutput;
