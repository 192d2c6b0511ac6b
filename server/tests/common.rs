//! Shared fixtures for the server tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use tower::ServiceExt;

use server::config::ServerConfig;
use server::AppState;
use tts_core::{PipelineConfig, ProviderError, SpeechOutput, SpeechProvider, TimingEvent, VoiceInfo};

/// Returns the unit text as audio bytes after a fixed delay. Text containing
/// "fail" is rejected by the provider.
pub struct EchoProvider {
    pub calls: AtomicUsize,
    pub voice_lookups: AtomicUsize,
    delay: Duration,
}

impl EchoProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn voice_lookups(&self) -> usize {
        self.voice_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechProvider for EchoProvider {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<SpeechOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if text.contains("fail") {
            return Err(ProviderError::Status {
                status: 503,
                body: "provider unavailable".into(),
            });
        }
        let words = text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| TimingEvent::new(w, i as u64 * 1_000_000, 1_000_000))
            .collect();
        Ok(SpeechOutput {
            audio: format!("RIFF{text}").into_bytes(),
            timings: words,
        })
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, ProviderError> {
        self.voice_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(["en-GB-SoniaNeural:en-GB", "en-US-AriaNeural:en-US", "de-DE-KatjaNeural:de-DE"]
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(name, locale)| VoiceInfo {
                name: name.to_string(),
                locale: Some(locale.to_string()),
                gender: Some("Female".to_string()),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub struct TestApp {
    pub state: AppState,
    pub provider: Arc<EchoProvider>,
    router: Router,
    // Removed on drop
    pub dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(unit_delay: Duration) -> Self {
        Self::build(unit_delay, None)
    }

    /// Routed like the server binary, with `per_minute` API requests allowed.
    pub fn rate_limited(per_minute: u32) -> Self {
        Self::build(Duration::ZERO, Some(per_minute))
    }

    fn build(unit_delay: Duration, rate_limit: Option<u32>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineConfig {
            output_dir: dir.path().to_path_buf(),
            artifact_retention: Duration::from_secs(2),
            ..PipelineConfig::default()
        };
        let mut config = ServerConfig {
            pipeline,
            ..ServerConfig::default()
        };
        if let Some(per_minute) = rate_limit {
            config.rate_limit_per_minute = per_minute;
        }
        let provider = Arc::new(EchoProvider {
            calls: AtomicUsize::new(0),
            voice_lookups: AtomicUsize::new(0),
            delay: unit_delay,
        });
        let state = AppState::new(config, provider.clone(), None);
        let router = match rate_limit {
            Some(_) => server::limited_app(state.clone()).unwrap(),
            None => server::app(state.clone()),
        };
        Self {
            state,
            provider,
            router,
            dir,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.request(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
