//! Bounded-concurrency synthesis of text units.
//!
//! Units are started in index order, at most `concurrency_limit` provider calls
//! at a time. Results are sent on an mpsc channel as they complete, in no
//! particular order; the channel closes once every started unit has reported.
//! A unit's permit is held until its result is handed to the channel, so a slow
//! consumer also bounds how far synthesis can run ahead.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::boundary::{write_sidecar, WordBoundary};
use crate::config::SynthesisConfig;
use crate::error::SynthesisFailure;
use crate::provider::SpeechProvider;
use crate::segment::TextUnit;
use crate::session::{FileCategory, Session};

/// Audio and timings produced for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisArtifact {
    pub unit_index: usize,
    pub text: String,
    pub audio_path: PathBuf,
    pub sidecar_path: Option<PathBuf>,
    pub boundaries: Vec<WordBoundary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(SynthesisArtifact),
    Failure(SynthesisFailure),
}

/// What a worker reports for one unit. Failures stay scoped to their unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub unit_index: usize,
    pub text: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

impl SynthesisResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn failure(unit: &TextUnit, reason: SynthesisFailure) -> Self {
        Self {
            unit_index: unit.index,
            text: unit.content.clone(),
            outcome: Outcome::Failure(reason),
            elapsed: Duration::ZERO,
        }
    }
}

/// Resolves once `stop` flips to true. A dropped sender means the run can no
/// longer be stopped, so this then never resolves.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Clone)]
pub struct SynthesisPool {
    provider: Arc<dyn SpeechProvider>,
    session: Arc<Session>,
    config: SynthesisConfig,
}

impl SynthesisPool {
    pub fn new(provider: Arc<dyn SpeechProvider>, session: Arc<Session>, config: SynthesisConfig) -> Self {
        Self {
            provider,
            session,
            config,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Start synthesizing `units` in the background. No new provider call is
    /// issued once `stop` is set or the receiver is dropped; calls already
    /// running finish and their results go to the channel if anyone listens.
    pub fn synthesize_all(
        &self,
        units: Vec<TextUnit>,
        mut stop: watch::Receiver<bool>,
    ) -> mpsc::Receiver<SynthesisResult> {
        let limit = self.config.concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(limit * 2);
        let semaphore = Arc::new(Semaphore::new(limit));
        let pool = self.clone();

        tokio::spawn(async move {
            let total = units.len();
            for unit in units {
                if *stop.borrow() {
                    debug!("Stop requested, not starting unit {} of {}", unit.index, total);
                    break;
                }
                if tx.is_closed() {
                    debug!("Consumer gone, not starting unit {} of {}", unit.index, total);
                    break;
                }

                let permit = tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => {
                        debug!("Stop requested while unit {} waited for a worker", unit.index);
                        break;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let tx = tx.clone();
                let pool = pool.clone();
                tokio::spawn(async move {
                    let index = unit.index;
                    let started = Instant::now();
                    let outcome = AssertUnwindSafe(pool.synthesize_unit(&unit))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            warn!("Synthesis worker for unit {} panicked", index);
                            Outcome::Failure(SynthesisFailure::Panicked)
                        });

                    let result = SynthesisResult {
                        unit_index: index,
                        text: unit.content,
                        outcome,
                        elapsed: started.elapsed(),
                    };
                    if tx.send(result).await.is_err() {
                        debug!("Consumer gone, discarding result for unit {}", index);
                    }
                    drop(permit);
                });
            }
            // The workers hold the remaining senders; the channel closes when the last one finishes
        });

        rx
    }

    async fn synthesize_unit(&self, unit: &TextUnit) -> Outcome {
        let started = Instant::now();
        let call = self.provider.synthesize(&unit.content, &self.config.voice);

        let output = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Unit {} failed at provider {}: {}", unit.index, self.provider.name(), e);
                return Outcome::Failure(e.into());
            }
            Err(_) => {
                warn!("Unit {} timed out after {:?}", unit.index, self.config.timeout);
                return Outcome::Failure(SynthesisFailure::Timeout(self.config.timeout));
            }
        };

        if output.audio.is_empty() {
            warn!("Unit {}: provider returned no audio", unit.index);
            return Outcome::Failure(SynthesisFailure::EmptyAudio);
        }

        let audio_path = self.session.path_for(FileCategory::Audio, unit.index);
        if let Err(e) = tokio::fs::write(&audio_path, &output.audio).await {
            warn!("Unit {}: cannot write {}: {}", unit.index, audio_path.display(), e);
            return Outcome::Failure(SynthesisFailure::Io(e.to_string()));
        }

        let boundaries = output.boundaries();
        let sidecar_path = if self.config.write_sidecar {
            let path = self.session.path_for(FileCategory::Text, unit.index);
            if let Err(e) = write_sidecar(&path, &boundaries, &self.config.delimiter).await {
                warn!("Unit {}: cannot write {}: {}", unit.index, path.display(), e);
                return Outcome::Failure(SynthesisFailure::Io(e.to_string()));
            }
            Some(path)
        } else {
            None
        };

        debug!(
            "Unit {} synthesized in {:.2}s ({} bytes, {} words)",
            unit.index,
            started.elapsed().as_secs_f64(),
            output.audio.len(),
            boundaries.len()
        );

        Outcome::Success(SynthesisArtifact {
            unit_index: unit.index,
            text: unit.content.clone(),
            audio_path,
            sidecar_path,
            boundaries,
        })
    }
}
