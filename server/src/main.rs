use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use server::config::ServerConfig;
use server::{limited_app, metrics, spawn_session_sweeper, translator_from_env, AppState};
use tts_core::{HttpSpeechProvider, SpeechProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting streaming TTS server...");
    metrics::mark_start();

    let config = ServerConfig::from_env();

    let provider: Arc<dyn SpeechProvider> = Arc::new(
        HttpSpeechProvider::from_env().context("speech provider is not configured")?,
    );
    let translator = translator_from_env();

    std::fs::create_dir_all(&config.pipeline.output_dir).with_context(|| {
        format!(
            "cannot create output directory {}",
            config.pipeline.output_dir.display()
        )
    })?;

    let state = AppState::new(config.clone(), provider, translator);
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, concurrency={}, output_dir={}",
        config.port,
        config.rate_limit_per_minute,
        config.pipeline.synthesis.concurrency_limit,
        config.pipeline.output_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_session_sweeper(state.clone(), shutdown_rx);

    let app = limited_app(state)
        .context("invalid rate limit configuration")?
        .layer(cors_layer(&config));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    Ok(())
}

// CORS configuration - environment-aware
fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [
        axum::http::Method::GET,
        axum::http::Method::POST,
        axum::http::Method::OPTIONS,
    ];
    let permissive = || {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods.clone())
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(false)
    };

    let Some(ref allowed_origins) = config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return permissive();
    };

    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        permissive()
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(false)
    }
}
