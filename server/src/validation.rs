use crate::error::ApiError;

/// Maximum text length for streamed requests, in characters
pub const MAX_STREAM_TEXT_LENGTH: usize = 100_000;
/// Maximum text length for single-shot synthesis, in characters
pub const MAX_SYNTHESIZE_TEXT_LENGTH: usize = 5000;
/// Longest accepted voice name
const MAX_VOICE_LENGTH: usize = 64;

/// Validate text and optional voice/language of a synthesis request
pub fn validate_tts_request(
    text: &str,
    voice: Option<&str>,
    language: Option<&str>,
    max_chars: usize,
) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    let length = text.chars().count();
    if length > max_chars {
        return Err(ApiError::InvalidInput(format!(
            "Text too long ({} characters, max {})",
            length, max_chars
        )));
    }

    if let Some(voice) = voice {
        if !is_valid_voice(voice) {
            return Err(ApiError::InvalidInput(format!("Invalid voice name: {voice}")));
        }
    }

    if let Some(lang) = language {
        if !is_valid_language_code(lang) {
            return Err(ApiError::InvalidInput(format!(
                "Invalid language code format: {}. Expected ll, ll_CC or ll-CC (e.g. de, en_US, pt-BR)",
                lang
            )));
        }
    }

    Ok(())
}

/// Voice names look like `en-GB-SoniaNeural`
fn is_valid_voice(voice: &str) -> bool {
    !voice.is_empty()
        && voice.len() <= MAX_VOICE_LENGTH
        && voice.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Language code: `ll`, `ll_CC` or `ll-CC`
fn is_valid_language_code(code: &str) -> bool {
    let parts: Vec<&str> = code.split(['_', '-']).collect();
    let lang_ok = |p: &str| p.len() == 2 && p.chars().all(|c| c.is_ascii_lowercase());
    match parts.len() {
        1 => lang_ok(parts[0]),
        2 => lang_ok(parts[0]) && parts[1].len() == 2 && parts[1].chars().all(|c| c.is_ascii_uppercase()),
        _ => false,
    }
}

/// Validate the `max_age_hours` of a cleanup request
pub fn validate_max_age_hours(hours: u64) -> Result<(), ApiError> {
    if hours == 0 || hours > 24 * 365 {
        return Err(ApiError::InvalidInput(format!(
            "max_age_hours must be between 1 and {}",
            24 * 365
        )));
    }
    Ok(())
}
