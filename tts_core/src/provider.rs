//! Speech synthesis provider seam.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::boundary::WordBoundary;
use crate::error::ProviderError;

/// One timing event as reported by the provider, in 100 ns ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEvent {
    #[serde(alias = "text")]
    pub word: String,
    #[serde(alias = "offset")]
    pub offset_ticks: u64,
    #[serde(alias = "duration")]
    pub duration_ticks: u64,
}

impl TimingEvent {
    pub fn new(word: impl Into<String>, offset_ticks: u64, duration_ticks: u64) -> Self {
        Self {
            word: word.into(),
            offset_ticks,
            duration_ticks,
        }
    }

    pub fn to_boundary(&self) -> WordBoundary {
        WordBoundary::from_ticks(self.word.clone(), self.offset_ticks, self.duration_ticks)
    }
}

/// Audio plus word timings for one piece of text.
#[derive(Debug, Clone, Default)]
pub struct SpeechOutput {
    pub audio: Vec<u8>,
    pub timings: Vec<TimingEvent>,
}

impl SpeechOutput {
    pub fn boundaries(&self) -> Vec<WordBoundary> {
        self.timings.iter().map(TimingEvent::to_boundary).collect()
    }
}

/// A voice offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    #[serde(alias = "ShortName", alias = "short_name")]
    pub name: String,
    #[serde(default, alias = "Locale")]
    pub locale: Option<String>,
    #[serde(default, alias = "Gender")]
    pub gender: Option<String>,
}

/// An external text-to-speech service.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<SpeechOutput, ProviderError>;

    /// Voices the provider can speak with. Providers without a catalogue
    /// report none.
    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, ProviderError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    word_boundaries: bool,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    audio_base64: String,
    #[serde(default)]
    word_boundaries: Vec<TimingEvent>,
}

/// Speech provider reached over a JSON HTTP API.
///
/// `POST {base_url}/synthesize` with `{text, voice, word_boundaries}` answers
/// `{audio_base64, word_boundaries: [{text, offset, duration}]}`, and
/// `GET {base_url}/voices` answers `[{name, locale, gender}]`.
#[derive(Debug, Clone)]
pub struct HttpSpeechProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSpeechProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(ProviderError::Config("speech provider URL is empty".to_string()));
        }
        // Per-call timeouts are applied by the worker pool
        let client = Client::builder().build()?;
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    /// Build from `TTS_API_URL` and `TTS_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let base_url = std::env::var("TTS_API_URL")
            .map_err(|_| ProviderError::Config("TTS_API_URL must be set".to_string()))?;
        let api_key = std::env::var("TTS_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Self::new(base_url, api_key)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn decode(body: SynthesizeResponse) -> Result<SpeechOutput, ProviderError> {
        let audio = base64::engine::general_purpose::STANDARD
            .decode(body.audio_base64.as_bytes())
            .map_err(|e| ProviderError::Malformed(format!("audio is not valid base64: {e}")))?;
        Ok(SpeechOutput {
            audio,
            timings: body.word_boundaries,
        })
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<SpeechOutput, ProviderError> {
        let url = self.endpoint("synthesize");
        let body = SynthesizeRequest {
            text,
            voice,
            word_boundaries: true,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let parsed = res
            .json::<SynthesizeResponse>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Self::decode(parsed)
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, ProviderError> {
        let mut req = self.client.get(self.endpoint("voices"));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        res.json::<Vec<VoiceInfo>>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_response() {
        let json = r#"{
            "audio_base64": "UklGRg==",
            "word_boundaries": [
                {"text": "hello", "offset": 1000000, "duration": 4000000}
            ]
        }"#;
        let parsed: SynthesizeResponse = serde_json::from_str(json).unwrap();
        let out = HttpSpeechProvider::decode(parsed).unwrap();
        assert_eq!(out.audio, b"RIFF");
        assert_eq!(out.boundaries(), vec![WordBoundary::new("hello", 0.1, 0.4)]);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let parsed = SynthesizeResponse {
            audio_base64: "not base64!!".to_string(),
            word_boundaries: Vec::new(),
        };
        assert!(matches!(
            HttpSpeechProvider::decode(parsed),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_boundaries_default_to_empty() {
        let parsed: SynthesizeResponse = serde_json::from_str(r#"{"audio_base64": ""}"#).unwrap();
        assert!(parsed.word_boundaries.is_empty());
    }

    #[test]
    fn test_voice_list_accepts_provider_field_names() {
        let json = r#"[
            {"name": "en-GB-SoniaNeural", "locale": "en-GB", "gender": "Female"},
            {"ShortName": "de-DE-KatjaNeural", "Locale": "de-DE"},
            {"name": "plain"}
        ]"#;
        let voices: Vec<VoiceInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(voices[0].gender.as_deref(), Some("Female"));
        assert_eq!(voices[1].name, "de-DE-KatjaNeural");
        assert_eq!(voices[1].locale.as_deref(), Some("de-DE"));
        assert_eq!(voices[2].locale, None);
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let provider = HttpSpeechProvider::new("http://tts.local/api/", None).unwrap();
        assert_eq!(provider.endpoint("voices"), "http://tts.local/api/voices");
    }

    #[test]
    fn test_empty_url_rejected() {
        assert!(matches!(
            HttpSpeechProvider::new("", None),
            Err(ProviderError::Config(_))
        ));
    }
}
