// Configuration for the synthesis pipeline

use std::path::PathBuf;
use std::time::Duration;

use crate::boundary::DEFAULT_DELIMITER;
use crate::segment::DEFAULT_BOUNDARY_CHARS;

/// Per-call synthesis settings. Threaded by value into every provider call;
/// per-request overrides build a new value instead of mutating a shared one.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisConfig {
    pub voice: String,
    pub concurrency_limit: usize,
    pub timeout: Duration,
    pub delimiter: String,
    pub write_sidecar: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice: "en-GB-SoniaNeural".to_string(),
            concurrency_limit: 2,
            timeout: Duration::from_secs(30),
            delimiter: DEFAULT_DELIMITER.to_string(),
            write_sidecar: true,
        }
    }
}

impl SynthesisConfig {
    pub fn with_voice(&self, voice: Option<&str>) -> Self {
        let mut next = self.clone();
        if let Some(v) = voice.map(str::trim).filter(|v| !v.is_empty()) {
            next.voice = v.to_string();
        }
        next
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub boundary_chars: Vec<char>,
    pub synthesis: SynthesisConfig,
    pub max_translate_chars: usize,
    pub target_language: Option<String>,
    pub session_max_age: Duration,
    pub artifact_retention: Duration,
    pub playback_tick: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("temp"),
            file_prefix: "output".to_string(),
            boundary_chars: DEFAULT_BOUNDARY_CHARS.to_vec(),
            synthesis: SynthesisConfig::default(),
            max_translate_chars: translate_core::DEFAULT_MAX_TRANSLATE_CHARS,
            target_language: None,
            session_max_age: Duration::from_secs(24 * 3600),
            artifact_retention: Duration::from_secs(300),
            playback_tick: Duration::from_millis(10),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let output_dir = std::env::var("TTS_OUTPUT_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let file_prefix = std::env::var("TTS_FILE_PREFIX")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(defaults.file_prefix);

        let boundary_chars = std::env::var("TTS_SPECIAL_CHARACTERS")
            .ok()
            .map(|v| parse_boundary_chars(&v))
            .filter(|chars| !chars.is_empty())
            .unwrap_or(defaults.boundary_chars);

        let synthesis = SynthesisConfig {
            voice: std::env::var("TTS_VOICE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.synthesis.voice),
            concurrency_limit: env_parse::<usize>("TTS_CONCURRENCY")
                .unwrap_or(defaults.synthesis.concurrency_limit)
                .max(1),
            timeout: env_parse("TTS_SYNTHESIS_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.synthesis.timeout),
            delimiter: std::env::var("TTS_DELIMITER")
                .ok()
                .filter(|d| !d.is_empty())
                .unwrap_or(defaults.synthesis.delimiter),
            write_sidecar: env_parse("TTS_WRITE_SIDECAR").unwrap_or(defaults.synthesis.write_sidecar),
        };

        let target_language = std::env::var("TTS_TARGET_LANGUAGE")
            .ok()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());

        Self {
            output_dir,
            file_prefix,
            boundary_chars,
            synthesis,
            max_translate_chars: env_parse("TTS_MAX_TRANSLATE_CHARS")
                .unwrap_or(defaults.max_translate_chars),
            target_language,
            session_max_age: env_parse::<u64>("TTS_SESSION_MAX_AGE_HOURS")
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.session_max_age),
            artifact_retention: env_parse("TTS_ARTIFACT_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.artifact_retention),
            playback_tick: env_parse("TTS_PLAYBACK_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.playback_tick),
        }
    }
}

/// Parse a comma-separated boundary list such as `.,?,!,\n`.
/// `\n`, `\t` and `\r` escapes are understood; multi-character entries are ignored.
pub fn parse_boundary_chars(list: &str) -> Vec<char> {
    let mut chars = Vec::new();
    for token in list.split(',') {
        let c = match token {
            "\\n" => Some('\n'),
            "\\t" => Some('\t'),
            "\\r" => Some('\r'),
            t => {
                let mut it = t.chars();
                match (it.next(), it.next()) {
                    (Some(c), None) => Some(c),
                    _ => None,
                }
            }
        };
        if let Some(c) = c {
            if !chars.contains(&c) {
                chars.push(c);
            }
        }
    }
    chars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boundary_chars() {
        assert_eq!(parse_boundary_chars(".,?,!,\\n"), vec!['.', '?', '!', '\n']);
        assert_eq!(parse_boundary_chars(".,.,;"), vec!['.', ';']);
        assert_eq!(parse_boundary_chars("ab,,!"), vec!['!']);
        assert!(parse_boundary_chars("").is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.synthesis.concurrency_limit, 2);
        assert_eq!(config.synthesis.delimiter, ":");
        assert_eq!(config.max_translate_chars, 5000);
        assert_eq!(config.playback_tick, Duration::from_millis(10));
        assert!(config.boundary_chars.contains(&'\n'));
    }

    #[test]
    fn test_with_voice_does_not_mutate_original() {
        let base = SynthesisConfig::default();
        let custom = base.with_voice(Some("en-US-AriaNeural"));
        assert_eq!(custom.voice, "en-US-AriaNeural");
        assert_eq!(base.voice, "en-GB-SoniaNeural");
        assert_eq!(base.with_voice(Some("  ")).voice, base.voice);
        assert_eq!(base.with_voice(None), base);
    }
}
