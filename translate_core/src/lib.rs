//! Translation stage of the speech pipeline.
//!
//! The translation provider is an external service that rejects oversized
//! input, so callers go through [`translate_text`], which splits the text on
//! line boundaries into budget-sized chunks and falls back to the source
//! chunk whenever the provider fails for that chunk.

mod cache;
mod http;

pub use cache::CachedTranslator;
pub use http::{HttpTranslator, HttpTranslatorConfig};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Default character budget per provider call.
pub const DEFAULT_MAX_TRANSLATE_CHARS: usize = 5000;

/// Errors a translation provider can report for one call.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("translation provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("translation provider returned an empty result")]
    Empty,

    #[error("translation configuration error: {0}")]
    Config(String),
}

/// A machine translation provider.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target_language` (e.g. `en`, `fr`).
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError>;

    fn name(&self) -> &str;
}

/// Pass-through translator, used when no target language is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, text: &str, _target_language: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Split text into chunks of at most `budget` characters along line
/// boundaries. Line endings are kept so that joining the chunks restores the
/// input exactly. A single line longer than the budget becomes its own chunk.
pub fn split_for_translation(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for line in text.split_inclusive('\n') {
        let line_chars = line.chars().count();
        if current_chars + line_chars > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push_str(line);
        current_chars += line_chars;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Translate `text` chunk by chunk. Never fails: a chunk the provider cannot
/// translate is kept in its original form.
pub async fn translate_text(
    translator: &dyn Translator,
    text: &str,
    target_language: &str,
    budget: usize,
) -> String {
    let chunks = split_for_translation(text, budget.max(1));
    debug!("{} chunk(s) to translate via {}", chunks.len(), translator.name());

    let mut out = String::with_capacity(text.len());
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.trim().is_empty() {
            out.push_str(chunk);
            continue;
        }
        match translator.translate(chunk, target_language).await {
            Ok(translated) => {
                out.push_str(&translated);
                // Providers tend to drop the trailing newline; keep chunk joins on line boundaries.
                if chunk.ends_with('\n') && !translated.ends_with('\n') {
                    out.push('\n');
                }
            }
            Err(e) => {
                warn!("Translation of chunk {}/{} failed, keeping source text: {}", i + 1, chunks.len(), e);
                out.push_str(chunk);
            }
        }
    }
    out
}
