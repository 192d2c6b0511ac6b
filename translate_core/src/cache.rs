use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::{TranslateError, Translator};

/// LRU cache in front of another translator. Only successful translations are
/// cached, so a provider failure is retried on the next request.
pub struct CachedTranslator<T> {
    inner: T,
    cache: Mutex<LruCache<String, String>>,
}

impl<T: Translator> CachedTranslator<T> {
    pub fn new(inner: T, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(text: &str, target_language: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(target_language.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: Translator> Translator for CachedTranslator<T> {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError> {
        let key = Self::cache_key(text, target_language);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let translated = self.inner.translate(text, target_language).await?;

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, translated.clone());
        Ok(translated)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
