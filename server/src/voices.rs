// Voice catalogue, kept in memory and in a file next to the sessions

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tts_core::{ProviderError, SpeechProvider, VoiceInfo};

/// How long a fetched voice list is trusted
pub const VOICE_CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// On-disk copy, relative to the output directory. Not a session, so the
/// sweeper leaves it alone.
pub const VOICE_CACHE_FILE: &str = "voices.json";

struct Cached {
    voices: Arc<Vec<VoiceInfo>>,
    fetched: Instant,
}

/// Lists the provider's voices, asking the provider at most once per
/// `max_age`.
pub struct VoiceCatalog {
    provider: Arc<dyn SpeechProvider>,
    cache_file: PathBuf,
    max_age: Duration,
    cached: RwLock<Option<Cached>>,
}

impl VoiceCatalog {
    pub fn new(provider: Arc<dyn SpeechProvider>, cache_file: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            provider,
            cache_file: cache_file.into(),
            max_age,
            cached: RwLock::new(None),
        }
    }

    pub async fn voices(&self) -> Result<Arc<Vec<VoiceInfo>>, ProviderError> {
        if let Some(voices) = self.fresh(self.cached.read().await.as_ref()) {
            return Ok(voices);
        }

        let mut cached = self.cached.write().await;
        // Filled by another request while this one waited
        if let Some(voices) = self.fresh(cached.as_ref()) {
            return Ok(voices);
        }

        let (voices, fetched) = match self.load_file().await {
            Some(loaded) => loaded,
            None => {
                let voices = self.provider.list_voices().await?;
                info!("Fetched {} voice(s) from {}", voices.len(), self.provider.name());
                self.save_file(&voices).await;
                (voices, Instant::now())
            }
        };
        let voices = Arc::new(voices);
        *cached = Some(Cached {
            voices: voices.clone(),
            fetched,
        });
        Ok(voices)
    }

    fn fresh(&self, cached: Option<&Cached>) -> Option<Arc<Vec<VoiceInfo>>> {
        cached
            .filter(|c| c.fetched.elapsed() < self.max_age)
            .map(|c| c.voices.clone())
    }

    async fn load_file(&self) -> Option<(Vec<VoiceInfo>, Instant)> {
        let age = tokio::fs::metadata(&self.cache_file)
            .await
            .ok()?
            .modified()
            .ok()?
            .elapsed()
            .unwrap_or_default();
        if age >= self.max_age {
            debug!("Voice cache {} is stale", self.cache_file.display());
            return None;
        }
        let bytes = tokio::fs::read(&self.cache_file).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(voices) => Some((voices, Instant::now().checked_sub(age).unwrap_or_else(Instant::now))),
            Err(e) => {
                warn!("Ignoring unreadable voice cache {}: {}", self.cache_file.display(), e);
                None
            }
        }
    }

    async fn save_file(&self, voices: &[VoiceInfo]) {
        let json = match serde_json::to_vec_pretty(voices) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot encode voice cache: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.cache_file, json).await {
            warn!("Cannot write voice cache {}: {}", self.cache_file.display(), e);
        }
    }
}

/// Voices whose locale starts with `locale`, ignoring case.
pub fn filter_by_locale(voices: &[VoiceInfo], locale: &str) -> Vec<VoiceInfo> {
    let wanted = locale.trim().to_lowercase();
    voices
        .iter()
        .filter(|v| {
            v.locale
                .as_deref()
                .is_some_and(|l| l.to_lowercase().starts_with(&wanted))
        })
        .cloned()
        .collect()
}
