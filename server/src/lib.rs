pub mod config;
pub mod error;
pub mod metrics;
pub mod validation;
pub mod voices;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use translate_core::{CachedTranslator, HttpTranslator, Translator};
use tts_core::{ClientRegistry, Pipeline, PipelineError, RunOptions, RunOutcome, SpeechProvider, VoiceInfo};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::{system_metrics, MetricsResponse, PipelineMetrics};
use crate::validation::{
    validate_max_age_hours, validate_tts_request, MAX_STREAM_TEXT_LENGTH, MAX_SYNTHESIZE_TEXT_LENGTH,
};
use crate::voices::{filter_by_locale, VoiceCatalog, VOICE_CACHE_FILE, VOICE_CACHE_MAX_AGE};

/// Translations kept in memory
const TRANSLATION_CACHE_SIZE: usize = 512;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub clients: Arc<ClientRegistry>,
    pub metrics: PipelineMetrics,
    pub voices: Arc<VoiceCatalog>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn SpeechProvider>,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        let voices = VoiceCatalog::new(
            provider.clone(),
            config.pipeline.output_dir.join(VOICE_CACHE_FILE),
            VOICE_CACHE_MAX_AGE,
        );
        let mut pipeline = Pipeline::new(config.pipeline.clone(), provider);
        if let Some(translator) = translator {
            pipeline = pipeline.with_translator(translator);
        }
        Self {
            pipeline: Arc::new(pipeline),
            clients: Arc::new(ClientRegistry::new()),
            metrics: PipelineMetrics::new(),
            voices: Arc::new(voices),
            config,
        }
    }
}

/// Cached HTTP translator when `TRANSLATE_API_URL` is set, otherwise none.
pub fn translator_from_env() -> Option<Arc<dyn Translator>> {
    if std::env::var("TRANSLATE_API_URL").map(|u| u.trim().is_empty()).unwrap_or(true) {
        info!("TRANSLATE_API_URL not set, translation disabled");
        return None;
    }
    match HttpTranslator::from_env() {
        Ok(http) => Some(Arc::new(CachedTranslator::new(http, TRANSLATION_CACHE_SIZE))),
        Err(e) => {
            warn!("Translation disabled: {e}");
            None
        }
    }
}

#[derive(Deserialize)]
pub struct StreamTtsRequest {
    pub text: String,
    pub client_id: u64,
    pub voice: Option<String>,
    pub language: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StreamStarted {
    pub status: String,
    pub session_id: String,
    pub client_id: u64,
    pub units: usize,
}

#[derive(Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StopResponse {
    pub client_id: u64,
    pub stopped: bool,
}

#[derive(Deserialize)]
pub struct VoicesParams {
    pub locale: Option<String>,
}

#[derive(Deserialize)]
pub struct CleanupParams {
    pub max_age_hours: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed_sessions: usize,
    pub max_age_hours: u64,
}

/// Routes plus the layers every deployment needs, without rate limiting.
/// CORS is added by the binary.
pub fn app(state: AppState) -> Router {
    router(state, api_routes())
}

/// [`app`] with the API routes behind one shared rate limit and the request
/// timeout. Audio downloads, sockets, health and metrics are not limited.
/// `None` if the rate limit cannot be configured.
pub fn limited_app(state: AppState) -> Option<Router> {
    let config = &state.config;

    // Global key so every client shares one budget, which also works behind proxies
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(((config.rate_limit_per_minute / 60).max(1)) as u64)
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()?,
    );
    info!("Rate limiting: {} API requests per minute", config.rate_limit_per_minute);

    let api_layers = ServiceBuilder::new()
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .into_inner();

    let api = api_routes().layer(api_layers);
    Some(router(state, api))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/synthesize", post(synthesize_endpoint))
        .route("/api/voices", get(voices_endpoint))
        .route("/api/tts/stream", post(stream_endpoint))
        .route("/api/tts/stop/{client_id}", post(stop_endpoint))
        .route("/api/cleanup", post(cleanup_endpoint))
}

fn router(state: AppState, api: Router<AppState>) -> Router {
    let audio_dir = ServeDir::new(state.config.pipeline.output_dir.clone());
    let audio_prefix = state.config.audio_url_prefix.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/ws/{client_id}", get(ws::ws_handler))
        .merge(api)
        .nest_service(&audio_prefix, audio_dir)
        .fallback(not_found)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(ref value) = value {
        request.headers_mut().insert("x-request-id", value.clone());
    }
    let mut response = next.run(request).await;
    if let Some(value) = value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn not_found(uri: axum::http::Uri) -> ApiError {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let request_count = state
        .metrics
        .request_count
        .load(std::sync::atomic::Ordering::Relaxed);
    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: system_metrics(request_count),
        pipeline: state.metrics.snapshot(),
        connected_clients: state.clients.connected_count(),
    })
}

/// Start streaming `text` to a connected WebSocket client. Returns as soon as
/// the run is set up; units arrive on the client's socket.
pub async fn stream_endpoint(
    State(state): State<AppState>,
    Json(req): Json<StreamTtsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.metrics.record_request();
    validate_tts_request(
        &req.text,
        req.voice.as_deref(),
        req.language.as_deref(),
        MAX_STREAM_TEXT_LENGTH,
    )?;

    let options = RunOptions {
        voice: req.voice,
        language: req.language,
    };
    let run = state
        .pipeline
        .start_stream(
            state.clients.clone(),
            req.client_id,
            &req.text,
            &options,
            &state.config.audio_url_prefix,
        )
        .await?;
    state.metrics.record_run_started();
    info!(
        "Streaming session {} ({} units) to client {}",
        run.session_id, run.units, req.client_id
    );

    let metrics = state.metrics.clone();
    let client_id = req.client_id;
    tokio::spawn(async move {
        match run.task.await {
            Ok(outcome) => metrics.record_outcome(&outcome),
            Err(e) => error!("Stream task for client {} failed: {}", client_id, e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StreamStarted {
            status: "processing_started".to_string(),
            session_id: run.session_id,
            client_id,
            units: run.units,
        }),
    ))
}

pub async fn stop_endpoint(
    State(state): State<AppState>,
    Path(client_id): Path<u64>,
) -> Json<StopResponse> {
    state.metrics.record_request();
    let stopped = state.clients.stop(client_id);
    if !stopped {
        debug!("Stop for client {} had no active run", client_id);
    }
    Json(StopResponse { client_id, stopped })
}

/// Synthesize the text as one unit and return the audio directly.
pub async fn synthesize_endpoint(
    State(state): State<AppState>,
    Json(req): Json<SynthesizeRequest>,
) -> Result<Response, ApiError> {
    state.metrics.record_request();
    validate_tts_request(
        &req.text,
        req.voice.as_deref(),
        req.language.as_deref(),
        MAX_SYNTHESIZE_TEXT_LENGTH,
    )?;

    let options = RunOptions {
        voice: req.voice,
        language: req.language,
    };
    state.metrics.record_run_started();
    let started = Instant::now();
    let result = state.pipeline.synthesize_once(&req.text, &options).await;

    let mut outcome = RunOutcome::new(1);
    outcome.synthesis_time = started.elapsed();
    match &result {
        Ok(_) => outcome.successful = 1,
        Err(PipelineError::Synthesis(_)) => outcome.failed = 1,
        Err(_) => {}
    }
    state.metrics.record_outcome(&outcome);

    let audio = result?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], audio).into_response())
}

/// Voices offered by the speech provider, optionally narrowed to a locale
/// prefix such as `en` or `en-GB`.
pub async fn voices_endpoint(
    State(state): State<AppState>,
    Query(params): Query<VoicesParams>,
) -> Result<Json<Vec<VoiceInfo>>, ApiError> {
    state.metrics.record_request();
    let voices = state
        .voices
        .voices()
        .await
        .map_err(|e| ApiError::ProviderUnavailable(e.to_string()))?;
    let voices = match params.locale.as_deref().filter(|l| !l.trim().is_empty()) {
        Some(locale) => filter_by_locale(&voices, locale),
        None => voices.to_vec(),
    };
    Ok(Json(voices))
}

pub async fn cleanup_endpoint(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<CleanupResponse>, ApiError> {
    state.metrics.record_request();
    let max_age_hours = params
        .max_age_hours
        .unwrap_or_else(|| (state.config.pipeline.session_max_age.as_secs() / 3600).max(1));
    validate_max_age_hours(max_age_hours)?;

    let removed_sessions = sweep(&state, Duration::from_secs(max_age_hours * 3600)).await?;
    Ok(Json(CleanupResponse {
        removed_sessions,
        max_age_hours,
    }))
}

async fn sweep(state: &AppState, max_age: Duration) -> Result<usize, ApiError> {
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.sweep_expired(max_age))
        .await
        .map_err(|e| ApiError::InternalError(format!("cleanup task failed: {e}")))
}

/// Periodically remove sessions older than the configured maximum age,
/// starting with one sweep right away. Ends when `shutdown` flips to true.
pub fn spawn_session_sweeper(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.cleanup_interval());
        let max_age = state.config.pipeline.session_max_age;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sweep(&state, max_age).await {
                        Ok(0) => {}
                        Ok(n) => info!("Session sweeper removed {} expired session(s)", n),
                        Err(e) => warn!("Session sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}
