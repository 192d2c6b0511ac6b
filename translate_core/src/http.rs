use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{TranslateError, Translator};

/// Request body for a LibreTranslate-compatible `/translate` endpoint
#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

#[derive(Debug, Clone)]
pub struct HttpTranslatorConfig {
    /// Base URL without trailing slash (e.g. http://localhost:5000).
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpTranslatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpTranslatorConfig {
    /// Reads `TRANSLATE_API_URL`, `TRANSLATE_API_KEY` and `TRANSLATE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("TRANSLATE_API_URL").unwrap_or(defaults.base_url);
        let api_key = std::env::var("TRANSLATE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let timeout = std::env::var("TRANSLATE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        Self { base_url, api_key, timeout }
    }
}

/// Translator backed by a LibreTranslate-compatible HTTP API.
pub struct HttpTranslator {
    config: HttpTranslatorConfig,
    client: Client,
}

impl HttpTranslator {
    pub fn new(config: HttpTranslatorConfig) -> Result<Self, TranslateError> {
        if config.base_url.trim().is_empty() {
            return Err(TranslateError::Config("translation base URL is empty".to_string()));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self, TranslateError> {
        Self::new(HttpTranslatorConfig::from_env())
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError> {
        let url = format!("{}/translate", self.config.base_url.trim_end_matches('/'));
        let body = TranslateRequest {
            q: text,
            source: "auto",
            target: target_language,
            format: "text",
            api_key: self.config.api_key.as_deref(),
        };

        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TranslateError::Status { status, body });
        }

        let parsed = res.json::<TranslateResponse>().await?;
        if parsed.translated_text.is_empty() {
            return Err(TranslateError::Empty);
        }
        Ok(parsed.translated_text)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = TranslateRequest {
            q: "Hallo",
            source: "auto",
            target: "en",
            format: "text",
            api_key: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["q"], "Hallo");
        assert_eq!(json["target"], "en");
        assert!(json.get("api_key").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let parsed: TranslateResponse =
            serde_json::from_str(r#"{"translatedText":"Hello"}"#).unwrap();
        assert_eq!(parsed.translated_text, "Hello");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let config = HttpTranslatorConfig {
            base_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(HttpTranslator::new(config), Err(TranslateError::Config(_))));
    }
}
