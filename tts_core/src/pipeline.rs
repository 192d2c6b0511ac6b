//! End-to-end runs: session, translation, segmentation, synthesis, ordered
//! delivery to one consumer, cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use translate_core::{translate_text, Translator};

use crate::config::{PipelineConfig, SynthesisConfig};
use crate::dispatch::{ClientRegistry, StreamDispatcher};
use crate::error::{PipelineError, SynthesisFailure};
use crate::playback::{AudioOutput, Clock, PlaybackSynchronizer, WordSink};
use crate::provider::SpeechProvider;
use crate::queue::{Delivery, OrderedResults};
use crate::segment::{segment, split_paragraphs, TextUnit};
use crate::session::{FileCategory, Session, SessionFileStore};
use crate::worker::{Outcome, SynthesisPool, SynthesisResult};

/// Tallies reported to the caller of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub stopped: bool,
    /// Sum of per-unit synthesis time.
    pub synthesis_time: Duration,
}

impl RunOutcome {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: &SynthesisResult) {
        self.synthesis_time += result.elapsed;
        match result.outcome {
            Outcome::Success(_) => self.successful += 1,
            Outcome::Failure(_) => self.failed += 1,
        }
    }
}

/// How input text is cut into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmentation {
    /// Boundary-character units, for local playback.
    Sentences,
    /// Blank-line paragraphs, for remote streams.
    Paragraphs,
    /// The whole text as one unit.
    Whole,
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub voice: Option<String>,
    /// Target language; text is translated first when set.
    pub language: Option<String>,
}

/// A run whose session exists and whose units are known.
pub struct PreparedRun {
    pub session: Arc<Session>,
    pub units: Vec<TextUnit>,
    pub synthesis: SynthesisConfig,
}

/// A remote run running in the background.
pub struct StreamRun {
    pub session_id: String,
    pub units: usize,
    pub task: JoinHandle<RunOutcome>,
}

#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    store: SessionFileStore,
    provider: Arc<dyn SpeechProvider>,
    translator: Option<Arc<dyn Translator>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, provider: Arc<dyn SpeechProvider>) -> Self {
        let store = SessionFileStore::new(config.output_dir.clone(), config.file_prefix.clone());
        Self {
            config,
            store,
            provider,
            translator: None,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionFileStore {
        &self.store
    }

    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        self.store.sweep_expired(max_age)
    }

    /// Create the session, translate if asked, and segment. A session that
    /// cannot be created is the one failure that aborts a run.
    pub async fn prepare(
        &self,
        text: &str,
        options: &RunOptions,
        segmentation: Segmentation,
    ) -> Result<PreparedRun, PipelineError> {
        let session = self.store.new_session()?;

        let target = options
            .language
            .as_deref()
            .or(self.config.target_language.as_deref());
        let text = match (target, &self.translator) {
            (Some(language), Some(translator)) => {
                let translated =
                    translate_text(translator.as_ref(), text, language, self.config.max_translate_chars).await;
                let path = session.run_path(FileCategory::Translation);
                if let Err(e) = tokio::fs::write(&path, &translated).await {
                    warn!("Could not save translation to {}: {}", path.display(), e);
                }
                translated
            }
            (Some(language), None) => {
                debug!("No translator configured, speaking source text instead of {}", language);
                text.to_string()
            }
            (None, _) => text.to_string(),
        };

        let units = match segmentation {
            Segmentation::Sentences => segment(&text, &self.config.boundary_chars),
            Segmentation::Paragraphs => split_paragraphs(&text, &self.config.boundary_chars),
            Segmentation::Whole => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![TextUnit::new(0, trimmed)]
                }
            }
        };
        debug!("Session {}: {} unit(s)", session.id(), units.len());

        Ok(PreparedRun {
            session,
            units,
            synthesis: self.config.synthesis.with_voice(options.voice.as_deref()),
        })
    }

    /// Start synthesis for a prepared run and return its in-order view.
    pub fn start(&self, prepared: PreparedRun, stop: watch::Receiver<bool>) -> OrderedResults {
        let total = prepared.units.len();
        let pool = SynthesisPool::new(self.provider.clone(), prepared.session, prepared.synthesis);
        let results = pool.synthesize_all(prepared.units, stop.clone());
        OrderedResults::new(results, total, stop)
    }

    /// Speak `text` locally. `make_player` builds the synchronizer on the
    /// playback thread, since audio devices are not always `Send`. Each unit's
    /// files are released once played; the session is cleaned up at the end.
    pub async fn run_local<O, C, W, F>(
        &self,
        text: &str,
        options: &RunOptions,
        stop: watch::Receiver<bool>,
        make_player: F,
    ) -> Result<RunOutcome, PipelineError>
    where
        O: AudioOutput + 'static,
        C: Clock + 'static,
        W: WordSink + 'static,
        F: FnOnce() -> PlaybackSynchronizer<O, C, W> + Send + 'static,
    {
        let prepared = self.prepare(text, options, Segmentation::Sentences).await?;
        let session = prepared.session.clone();
        let mut ordered = self.start(prepared, stop);
        let runtime = tokio::runtime::Handle::current();
        let consumer_session = session.clone();

        let consumer = tokio::task::spawn_blocking(move || {
            let mut player = make_player();
            let mut outcome = RunOutcome::new(ordered.total());
            loop {
                match runtime.block_on(ordered.next()) {
                    Delivery::Unit(result) => {
                        outcome.record(&result);
                        player.consume(&result);
                        if let Outcome::Success(artifact) = &result.outcome {
                            consumer_session.release(&artifact.audio_path);
                            if let Some(sidecar) = &artifact.sidecar_path {
                                consumer_session.release(sidecar);
                            }
                        }
                    }
                    Delivery::Finished => break,
                    Delivery::Stopped => {
                        outcome.stopped = true;
                        break;
                    }
                }
            }
            runtime.block_on(ordered.drain());
            outcome
        });

        let outcome = consumer.await.map_err(|e| PipelineError::Consumer(e.to_string()));
        session.cleanup();

        let outcome = outcome?;
        info!(
            "Local run {} finished: {} ok, {} failed{}",
            session.id(),
            outcome.successful,
            outcome.failed,
            if outcome.stopped { " (stopped)" } else { "" }
        );
        Ok(outcome)
    }

    /// Start streaming `text` to a connected client in the background. The
    /// session is kept for `artifact_retention` after the stream ends so the
    /// client can still fetch the URLs it was sent.
    pub async fn start_stream(
        &self,
        registry: Arc<ClientRegistry>,
        client_id: u64,
        text: &str,
        options: &RunOptions,
        url_prefix: &str,
    ) -> Result<StreamRun, PipelineError> {
        if !registry.is_connected(client_id) {
            return Err(PipelineError::ClientNotConnected(client_id));
        }
        let prepared = self.prepare(text, options, Segmentation::Paragraphs).await?;
        let session = prepared.session.clone();

        let Some(ticket) = registry.begin_run(client_id) else {
            session.cleanup();
            return Err(PipelineError::ClientNotConnected(client_id));
        };

        let units = prepared.units.len();
        let ordered = self.start(prepared, ticket.stop.clone());
        let dispatcher = StreamDispatcher::new(registry.clone(), session.clone(), url_prefix);
        let retention = self.config.artifact_retention;
        let session_id = session.id().to_string();

        let task = tokio::spawn(async move {
            // A superseded run still holds the turn until its `stopped` frame is queued
            let _turn = ticket.delivery_turn().await;
            let outcome = dispatcher
                .dispatch(client_id, units, ordered.into_stream(), ticket.stop.clone())
                .await;
            registry.finish_run(client_id, ticket.id);
            schedule_cleanup(session, retention);
            outcome
        });

        Ok(StreamRun {
            session_id,
            units,
            task,
        })
    }

    /// Synthesize the whole text as one unit and return the audio bytes.
    /// Nothing is left on disk afterwards.
    pub async fn synthesize_once(&self, text: &str, options: &RunOptions) -> Result<Vec<u8>, PipelineError> {
        let prepared = self.prepare(text, options, Segmentation::Whole).await?;
        let session = prepared.session.clone();
        if prepared.units.is_empty() {
            session.cleanup();
            return Err(PipelineError::EmptyText);
        }

        let (_stop_tx, stop) = watch::channel(false);
        let mut ordered = self.start(prepared, stop);
        let result = match ordered.next().await {
            Delivery::Unit(result) => match result.outcome {
                Outcome::Success(artifact) => tokio::fs::read(&artifact.audio_path)
                    .await
                    .map_err(|e| PipelineError::Synthesis(SynthesisFailure::Io(e.to_string()))),
                Outcome::Failure(reason) => Err(PipelineError::Synthesis(reason)),
            },
            Delivery::Finished | Delivery::Stopped => Err(PipelineError::Synthesis(SynthesisFailure::Missing)),
        };
        session.cleanup();
        result
    }
}

fn schedule_cleanup(session: Arc<Session>, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let removed = session.cleanup();
        debug!("Session {} released after retention ({} file(s))", session.id(), removed);
    });
}
