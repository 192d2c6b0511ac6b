//! Remote delivery of ordered results to connected clients.
//!
//! Each client holds one persistent connection, registered in the
//! [`ClientRegistry`] with a frame channel. A run for that client gets its own
//! stop channel; [`ClientRegistry::stop`] flips it, which halts both the
//! dispatcher and the worker pool feeding it. Runs for one connection take
//! turns on its delivery lock, so a superseded run's last frame is always
//! queued before the next run's `start`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::pipeline::RunOutcome;
use crate::session::Session;
use crate::worker::{stop_requested, Outcome, SynthesisResult};

/// Frames buffered per client before sends start waiting.
const FRAME_BUFFER: usize = 64;

/// Messages sent to a client, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Start,
    AudioUrl { url: String, text: String },
    Complete { successful_count: usize, failed_count: usize },
    Error { message: String },
    Stopped,
}

impl Frame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"frame encoding failed"}"#.into())
    }
}

struct ActiveRun {
    id: u64,
    stop: watch::Sender<bool>,
}

struct ClientHandle {
    connection: u64,
    frames: mpsc::Sender<Frame>,
    run: Option<ActiveRun>,
    delivery: Arc<Mutex<()>>,
}

/// A run admitted by [`ClientRegistry::begin_run`].
pub struct RunTicket {
    pub id: u64,
    pub stop: watch::Receiver<bool>,
    delivery: Arc<Mutex<()>>,
}

impl RunTicket {
    /// Wait until the connection's previous run has sent its last frame.
    pub async fn delivery_turn(&self) -> OwnedMutexGuard<()> {
        self.delivery.clone().lock_owned().await
    }
}

/// A live connection's receiving end.
pub struct Connection {
    pub client_id: u64,
    pub connection: u64,
    pub frames: mpsc::Receiver<Frame>,
}

/// Connected clients, keyed by client id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<u64, ClientHandle>,
    next_connection: AtomicU64,
    next_run: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `client_id`. A previous connection under the
    /// same id is replaced and its run stopped.
    pub fn register(&self, client_id: u64) -> Connection {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let handle = ClientHandle {
            connection,
            frames: tx,
            run: None,
            delivery: Arc::new(Mutex::new(())),
        };
        if let Some(old) = self.clients.insert(client_id, handle) {
            warn!("Client {} reconnected, replacing previous connection", client_id);
            if let Some(run) = old.run {
                let _ = run.stop.send(true);
            }
        }
        info!("Client {} connected", client_id);
        Connection {
            client_id,
            connection,
            frames: rx,
        }
    }

    /// Drop the connection and stop its run. A newer connection under the
    /// same id is left alone.
    pub fn unregister(&self, client_id: u64, connection: u64) {
        if let Some((_, handle)) = self.clients.remove_if(&client_id, |_, h| h.connection == connection) {
            if let Some(run) = handle.run {
                let _ = run.stop.send(true);
            }
            info!("Client {} disconnected", client_id);
        }
    }

    pub fn is_connected(&self, client_id: u64) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    /// Start a new run for the client. Any run already going for this client
    /// is stopped first.
    pub fn begin_run(&self, client_id: u64) -> Option<RunTicket> {
        let mut handle = self.clients.get_mut(&client_id)?;
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        if let Some(previous) = handle.run.replace(ActiveRun { id, stop: tx }) {
            debug!("Client {}: run {} supersedes run {}", client_id, id, previous.id);
            let _ = previous.stop.send(true);
        }
        Some(RunTicket {
            id,
            stop: rx,
            delivery: handle.delivery.clone(),
        })
    }

    /// Forget run `run_id` once it has delivered its last frame. A newer run
    /// for the client is left alone.
    pub fn finish_run(&self, client_id: u64, run_id: u64) {
        if let Some(mut handle) = self.clients.get_mut(&client_id) {
            if handle.run.as_ref().is_some_and(|run| run.id == run_id) {
                handle.run = None;
            }
        }
    }

    /// Stop the client's current run. Returns false if there was nothing to stop.
    pub fn stop(&self, client_id: u64) -> bool {
        let Some(handle) = self.clients.get(&client_id) else {
            return false;
        };
        match &handle.run {
            Some(run) if !*run.stop.borrow() => {
                info!("Stop requested for client {}", client_id);
                run.stop.send(true).is_ok()
            }
            _ => false,
        }
    }

    /// Queue a frame for the client. False if the client is gone.
    pub async fn send(&self, client_id: u64, frame: Frame) -> bool {
        // Clone the sender so no map guard is held across the await
        let Some(tx) = self.clients.get(&client_id).map(|h| h.frames.clone()) else {
            return false;
        };
        tx.send(frame).await.is_ok()
    }
}

/// Pushes in-order results to one client as `audio_url` frames.
pub struct StreamDispatcher {
    registry: Arc<ClientRegistry>,
    session: Arc<Session>,
    url_prefix: String,
}

impl StreamDispatcher {
    pub fn new(registry: Arc<ClientRegistry>, session: Arc<Session>, url_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            session,
            url_prefix: url_prefix.into(),
        }
    }

    /// Deliver `results` to `client_id`, framed by `start` and then one of
    /// `complete`, `error` or `stopped`. `total` is the number of units expected.
    pub async fn dispatch<S>(
        &self,
        client_id: u64,
        total: usize,
        results: S,
        mut stop: watch::Receiver<bool>,
    ) -> RunOutcome
    where
        S: Stream<Item = SynthesisResult> + Send,
    {
        let mut outcome = RunOutcome::new(total);
        futures::pin_mut!(results);

        if *stop.borrow() {
            debug!("Run for client {} was superseded before it started", client_id);
            outcome.stopped = true;
            return outcome;
        }

        if !self.registry.send(client_id, Frame::Start).await {
            warn!("Client {} gone before the stream started", client_id);
            outcome.stopped = true;
            return outcome;
        }

        let mut client_gone = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                next = results.next() => next,
            };
            let Some(result) = next else { break };
            outcome.synthesis_time += result.elapsed;

            let artifact = match &result.outcome {
                Outcome::Success(artifact) => artifact,
                Outcome::Failure(reason) => {
                    debug!("Unit {} skipped for client {}: {}", result.unit_index, client_id, reason);
                    outcome.failed += 1;
                    continue;
                }
            };
            let url = match self.session.web_url(&artifact.audio_path, &self.url_prefix) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Unit {}: {}", result.unit_index, e);
                    outcome.failed += 1;
                    continue;
                }
            };
            let frame = Frame::AudioUrl {
                url,
                text: artifact.text.clone(),
            };
            if !self.registry.send(client_id, frame).await {
                client_gone = true;
                break;
            }
            outcome.successful += 1;
        }

        if client_gone {
            info!("Client {} disconnected mid-stream", client_id);
            outcome.stopped = true;
        } else if *stop.borrow() {
            outcome.stopped = true;
            self.registry.send(client_id, Frame::Stopped).await;
        } else if outcome.successful == 0 {
            let message = format!("No audio could be generated ({} unit(s) failed)", outcome.failed);
            self.registry.send(client_id, Frame::Error { message }).await;
        } else {
            let frame = Frame::Complete {
                successful_count: outcome.successful,
                failed_count: outcome.failed,
            };
            self.registry.send(client_id, frame).await;
        }

        info!(
            "Stream to client {} finished: {} ok, {} failed{}",
            client_id,
            outcome.successful,
            outcome.failed,
            if outcome.stopped { " (stopped)" } else { "" }
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynthesisFailure;
    use crate::segment::TextUnit;
    use crate::session::{FileCategory, SessionFileStore};
    use crate::worker::SynthesisArtifact;

    fn success(session: &Session, index: usize, text: &str) -> SynthesisResult {
        SynthesisResult {
            unit_index: index,
            text: text.to_string(),
            outcome: Outcome::Success(SynthesisArtifact {
                unit_index: index,
                text: text.to_string(),
                audio_path: session.path_for(FileCategory::Audio, index),
                sidecar_path: None,
                boundaries: Vec::new(),
            }),
            elapsed: Default::default(),
        }
    }

    fn failure(index: usize) -> SynthesisResult {
        SynthesisResult::failure(&TextUnit::new(index, "x"), SynthesisFailure::Timeout(Default::default()))
    }

    fn drain(conn: &mut Connection) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = conn.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_frame_json_shape() {
        assert_eq!(Frame::Start.to_json(), r#"{"type":"start"}"#);
        assert_eq!(Frame::Stopped.to_json(), r#"{"type":"stopped"}"#);
        let value: serde_json::Value = serde_json::from_str(
            &Frame::Complete {
                successful_count: 2,
                failed_count: 1,
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["successful_count"], 2);
        assert_eq!(value["failed_count"], 1);
        let url = Frame::AudioUrl {
            url: "/audio/a.wav".into(),
            text: "hi".into(),
        };
        assert_eq!(url.to_json(), r#"{"type":"audio_url","url":"/audio/a.wav","text":"hi"}"#);
    }

    #[tokio::test]
    async fn test_dispatch_counts_failures_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionFileStore::new(dir.path(), "output").new_session().unwrap();
        let registry = Arc::new(ClientRegistry::new());
        let mut conn = registry.register(7);
        let stop = registry.begin_run(7).unwrap().stop;

        let results = futures::stream::iter(vec![
            success(&session, 0, "first"),
            failure(1),
            success(&session, 2, "third"),
        ]);
        let dispatcher = StreamDispatcher::new(registry.clone(), session.clone(), "/audio");
        let outcome = dispatcher.dispatch(7, 3, results, stop).await;

        assert_eq!((outcome.successful, outcome.failed, outcome.stopped), (2, 1, false));
        let frames = drain(&mut conn);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], Frame::Start);
        assert!(matches!(&frames[1], Frame::AudioUrl { text, url } if text == "first" && url.starts_with("/audio/session_")));
        assert!(matches!(&frames[2], Frame::AudioUrl { text, .. } if text == "third"));
        assert_eq!(
            frames[3],
            Frame::Complete {
                successful_count: 2,
                failed_count: 1
            }
        );
    }

    #[tokio::test]
    async fn test_all_failed_sends_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionFileStore::new(dir.path(), "output").new_session().unwrap();
        let registry = Arc::new(ClientRegistry::new());
        let mut conn = registry.register(1);
        let stop = registry.begin_run(1).unwrap().stop;

        let dispatcher = StreamDispatcher::new(registry.clone(), session, "/audio");
        let outcome = dispatcher
            .dispatch(1, 2, futures::stream::iter(vec![failure(0), failure(1)]), stop)
            .await;

        assert_eq!(outcome.failed, 2);
        let frames = drain(&mut conn);
        assert!(matches!(frames.last(), Some(Frame::Error { .. })));
    }

    #[tokio::test]
    async fn test_stop_sends_stopped_frame() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionFileStore::new(dir.path(), "output").new_session().unwrap();
        let registry = Arc::new(ClientRegistry::new());
        let mut conn = registry.register(3);
        let stop = registry.begin_run(3).unwrap().stop;

        let (tx, rx) = mpsc::channel(4);
        tx.send(success(&session, 0, "zero")).await.unwrap();
        let results = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|r| (r, rx)) });

        let dispatcher = StreamDispatcher::new(registry.clone(), session.clone(), "/audio");
        let task = tokio::spawn(async move { dispatcher.dispatch(3, 5, results, stop).await });

        assert_eq!(conn.frames.recv().await, Some(Frame::Start));
        assert!(matches!(conn.frames.recv().await, Some(Frame::AudioUrl { .. })));
        assert!(registry.stop(3));
        assert!(!registry.stop(3));
        let outcome = task.await.unwrap();
        drop(tx);

        assert!(outcome.stopped);
        assert_eq!(outcome.successful, 1);
        assert_eq!(drain(&mut conn), vec![Frame::Stopped]);
    }

    #[tokio::test]
    async fn test_unknown_client_cannot_start_run() {
        let registry = ClientRegistry::new();
        assert!(registry.begin_run(42).is_none());
        assert!(!registry.stop(42));
        assert!(!registry.send(42, Frame::Start).await);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_newest_connection() {
        let registry = ClientRegistry::new();
        let first = registry.register(5);
        let old_run = registry.begin_run(5).unwrap().stop;
        let second = registry.register(5);

        assert!(*old_run.borrow());
        registry.unregister(5, first.connection);
        assert!(registry.is_connected(5));
        registry.unregister(5, second.connection);
        assert!(!registry.is_connected(5));
    }

    #[tokio::test]
    async fn test_new_run_supersedes_previous() {
        let registry = ClientRegistry::new();
        let _conn = registry.register(9);
        let first = registry.begin_run(9).unwrap();
        let second = registry.begin_run(9).unwrap();
        assert!(*first.stop.borrow());
        assert!(!*second.stop.borrow());

        // The old run finishing does not clear the new one
        registry.finish_run(9, first.id);
        assert!(registry.stop(9));
    }

    #[tokio::test]
    async fn test_finished_run_cannot_be_stopped() {
        let registry = ClientRegistry::new();
        let _conn = registry.register(4);
        let ticket = registry.begin_run(4).unwrap();
        registry.finish_run(4, ticket.id);
        assert!(!registry.stop(4));
        assert!(!*ticket.stop.borrow());
    }

    #[tokio::test]
    async fn test_runs_take_turns_on_delivery() {
        let registry = ClientRegistry::new();
        let _conn = registry.register(6);
        let first = registry.begin_run(6).unwrap();
        let turn = first.delivery_turn().await;

        let second = registry.begin_run(6).unwrap();
        let waiting = tokio::spawn(async move {
            let _turn = second.delivery_turn().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(turn);
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn test_superseded_before_start_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionFileStore::new(dir.path(), "output").new_session().unwrap();
        let registry = Arc::new(ClientRegistry::new());
        let mut conn = registry.register(8);
        let stale = registry.begin_run(8).unwrap();
        let _fresh = registry.begin_run(8).unwrap();

        let dispatcher = StreamDispatcher::new(registry.clone(), session.clone(), "/audio");
        let outcome = dispatcher
            .dispatch(8, 1, futures::stream::iter(vec![success(&session, 0, "late")]), stale.stop)
            .await;

        assert!(outcome.stopped);
        assert!(drain(&mut conn).is_empty());
    }
}
