//! Local playback with word-synchronized display.
//!
//! [`PlaybackSynchronizer`] plays one unit at a time and reveals its words as
//! the audio clock passes their offsets. The reveal step is a pure function of
//! elapsed time, the boundaries, and the set already shown, so it can be tested
//! without an audio device. A word whose window was skipped over by a coarse
//! tick is still revealed on the next tick, and any words left when the audio
//! ends are flushed, so each word is shown exactly once whatever the tick size.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::boundary::{load_sidecar, WordBoundary};
use crate::error::PlaybackError;
use crate::worker::{Outcome, SynthesisArtifact, SynthesisResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    NotStarted,
    Playing,
    Finished,
}

/// Indices of boundaries due at `elapsed` seconds that are not in `shown`,
/// in offset order.
pub fn due_words(boundaries: &[WordBoundary], shown: &HashSet<usize>, elapsed: f64) -> Vec<usize> {
    let mut due: Vec<usize> = boundaries
        .iter()
        .enumerate()
        .filter(|(i, b)| !shown.contains(i) && b.offset_seconds <= elapsed)
        .map(|(i, _)| i)
        .collect();
    due.sort_by(|a, b| boundaries[*a].offset_seconds.total_cmp(&boundaries[*b].offset_seconds));
    due
}

/// Tracks which words of one unit have been revealed.
#[derive(Debug, Default)]
pub struct WordRevealer {
    boundaries: Vec<WordBoundary>,
    shown: HashSet<usize>,
}

impl WordRevealer {
    pub fn new(boundaries: Vec<WordBoundary>) -> Self {
        Self {
            boundaries,
            shown: HashSet::new(),
        }
    }

    /// Words that became due since the last call. Marks them shown.
    pub fn reveal(&mut self, elapsed: Duration) -> Vec<&str> {
        let due = due_words(&self.boundaries, &self.shown, elapsed.as_secs_f64());
        self.shown.extend(due.iter().copied());
        due.into_iter().map(|i| self.boundaries[i].word.as_str()).collect()
    }

    /// Everything not yet shown, in offset order.
    pub fn flush(&mut self) -> Vec<&str> {
        self.reveal(Duration::MAX)
    }

    pub fn remaining(&self) -> usize {
        self.boundaries.len() - self.shown.len()
    }
}

/// An audio device that can play one file at a time.
pub trait AudioOutput {
    fn start(&mut self, path: &Path) -> Result<(), PlaybackError>;

    fn is_active(&self) -> bool;

    fn stop(&mut self);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn start(&mut self, path: &Path) -> Result<(), PlaybackError> {
        (**self).start(path)
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Used when there is no audio device: every unit is shown as text.
#[derive(Debug, Default)]
pub struct TextOnlyOutput;

impl AudioOutput for TextOnlyOutput {
    fn start(&mut self, _path: &Path) -> Result<(), PlaybackError> {
        Err(PlaybackError::Device("no audio output".to_string()))
    }

    fn is_active(&self) -> bool {
        false
    }

    fn stop(&mut self) {}
}

/// Monotonic time source for the tick loop.
pub trait Clock {
    fn start(&mut self);

    fn elapsed(&self) -> Duration;

    /// Block until the next tick.
    fn wait(&mut self, tick: Duration);
}

#[derive(Debug)]
pub struct MonotonicClock {
    started: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn start(&mut self) {
        self.started = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn wait(&mut self, tick: Duration) {
        std::thread::sleep(tick);
    }
}

/// Receives revealed words.
pub trait WordSink {
    fn word(&mut self, word: &str);

    /// Text shown instead of timed words when a unit cannot be played.
    fn fallback(&mut self, text: &str);

    fn end_unit(&mut self) {}
}

/// Prints words to stdout as they are spoken.
#[derive(Debug, Default)]
pub struct ConsoleWords;

impl WordSink for ConsoleWords {
    fn word(&mut self, word: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{word} ");
        let _ = out.flush();
    }

    fn fallback(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{text} ");
        let _ = out.flush();
    }

    fn end_unit(&mut self) {
        println!();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackReport {
    pub words_shown: usize,
    pub audio_played: bool,
}

pub struct PlaybackSynchronizer<O, C, W> {
    output: O,
    clock: C,
    sink: W,
    tick: Duration,
    delimiter: String,
    state: PlaybackState,
}

impl<O: AudioOutput, C: Clock, W: WordSink> PlaybackSynchronizer<O, C, W> {
    pub fn new(output: O, clock: C, sink: W, tick: Duration, delimiter: impl Into<String>) -> Self {
        Self {
            output,
            clock,
            sink,
            tick: tick.max(Duration::from_millis(1)),
            delimiter: delimiter.into(),
            state: PlaybackState::NotStarted,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Consume one in-order result: play it, or show its text if it failed.
    pub fn consume(&mut self, result: &SynthesisResult) -> PlaybackReport {
        match &result.outcome {
            Outcome::Success(artifact) => self.play(artifact),
            Outcome::Failure(reason) => {
                debug!("Unit {} has no audio ({}), showing text", result.unit_index, reason);
                self.state = PlaybackState::Finished;
                if !result.text.is_empty() {
                    self.sink.fallback(&result.text);
                    self.sink.end_unit();
                }
                PlaybackReport::default()
            }
        }
    }

    /// Play one unit's audio and reveal its words. Blocks until playback ends.
    /// Errors fall back to showing the text and never propagate.
    pub fn play(&mut self, artifact: &SynthesisArtifact) -> PlaybackReport {
        self.state = PlaybackState::NotStarted;
        let mut revealer = WordRevealer::new(self.load_boundaries(artifact));

        if let Err(e) = self.output.start(&artifact.audio_path) {
            warn!("Unit {}: playback failed, showing text only: {}", artifact.unit_index, e);
            let words = revealer.flush();
            let shown = words.len();
            if words.is_empty() {
                self.sink.fallback(&artifact.text);
            } else {
                for word in words {
                    self.sink.word(word);
                }
            }
            self.sink.end_unit();
            self.state = PlaybackState::Finished;
            return PlaybackReport {
                words_shown: shown,
                audio_played: false,
            };
        }

        self.clock.start();
        self.state = PlaybackState::Playing;
        let mut shown = 0;

        loop {
            for word in revealer.reveal(self.clock.elapsed()) {
                self.sink.word(word);
                shown += 1;
            }
            if !self.output.is_active() {
                break;
            }
            self.clock.wait(self.tick);
        }

        for word in revealer.flush() {
            self.sink.word(word);
            shown += 1;
        }
        self.output.stop();
        self.sink.end_unit();
        self.state = PlaybackState::Finished;

        PlaybackReport {
            words_shown: shown,
            audio_played: true,
        }
    }

    fn load_boundaries(&self, artifact: &SynthesisArtifact) -> Vec<WordBoundary> {
        let Some(path) = &artifact.sidecar_path else {
            return artifact.boundaries.clone();
        };
        match load_sidecar(path, &self.delimiter) {
            Ok(boundaries) => boundaries,
            Err(e) => {
                warn!("Cannot read {}: {}, using in-memory timings", path.display(), e);
                artifact.boundaries.clone()
            }
        }
    }
}

#[cfg(feature = "playback")]
pub use rodio_output::RodioOutput;

#[cfg(feature = "playback")]
mod rodio_output {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;

    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};

    use super::AudioOutput;
    use crate::error::PlaybackError;

    /// Default output device. Not `Send`; create it on the thread that plays.
    pub struct RodioOutput {
        _stream: OutputStream,
        handle: OutputStreamHandle,
        sink: Option<Sink>,
    }

    impl RodioOutput {
        pub fn try_default() -> Result<Self, PlaybackError> {
            let (stream, handle) =
                OutputStream::try_default().map_err(|e| PlaybackError::Device(e.to_string()))?;
            Ok(Self {
                _stream: stream,
                handle,
                sink: None,
            })
        }
    }

    impl AudioOutput for RodioOutput {
        fn start(&mut self, path: &Path) -> Result<(), PlaybackError> {
            let file = File::open(path)?;
            let source = Decoder::new(BufReader::new(file)).map_err(|e| PlaybackError::Decode(e.to_string()))?;
            let sink = Sink::try_new(&self.handle).map_err(|e| PlaybackError::Device(e.to_string()))?;
            sink.append(source);
            self.sink = Some(sink);
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.sink.as_ref().map(|s| !s.empty()).unwrap_or(false)
        }

        fn stop(&mut self) {
            if let Some(sink) = self.sink.take() {
                sink.stop();
            }
        }
    }
}
