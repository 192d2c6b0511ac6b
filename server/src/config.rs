// Configuration for the HTTP/WebSocket server

use std::time::Duration;

use tts_core::PipelineConfig;

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Mount point of the session store; `audio_url` frames are built under it.
    pub audio_url_prefix: String,
    pub cleanup_interval_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            audio_url_prefix: "/audio".to_string(),
            cleanup_interval_secs: 3600,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8085);

        let rate_limit_per_minute = std::env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        // Must start with '/' to be mountable as a route
        let audio_url_prefix = std::env::var("AUDIO_URL_PREFIX")
            .ok()
            .map(|p| format!("/{}", p.trim().trim_matches('/')))
            .filter(|p| p.len() > 1)
            .unwrap_or_else(|| "/audio".to_string());

        let cleanup_interval_secs = std::env::var("CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(3600);

        Self {
            port,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
            audio_url_prefix,
            cleanup_interval_secs,
            pipeline: PipelineConfig::from_env(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
