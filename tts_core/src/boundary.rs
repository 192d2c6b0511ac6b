//! Word boundary timing metadata and its sidecar text format.
//!
//! A sidecar holds one record per line: `word<DELIM>offset_seconds<DELIM>duration_seconds`.
//! Lines that do not split into exactly three fields, or whose numbers do not
//! parse, are dropped without affecting the rest of the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Provider timings are in 100-nanosecond ticks.
pub const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// Default field delimiter for sidecar records.
pub const DEFAULT_DELIMITER: &str = ":";

/// Locates one spoken word inside its unit's audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordBoundary {
    pub word: String,
    pub offset_seconds: f64,
    pub duration_seconds: f64,
}

impl WordBoundary {
    pub fn new(word: impl Into<String>, offset_seconds: f64, duration_seconds: f64) -> Self {
        Self {
            word: word.into(),
            offset_seconds,
            duration_seconds,
        }
    }

    /// Build from provider tick values.
    pub fn from_ticks(word: impl Into<String>, offset_ticks: u64, duration_ticks: u64) -> Self {
        Self::new(
            word,
            offset_ticks as f64 / TICKS_PER_SECOND,
            duration_ticks as f64 / TICKS_PER_SECOND,
        )
    }

    pub fn end_seconds(&self) -> f64 {
        self.offset_seconds + self.duration_seconds
    }

    /// Whether `elapsed` falls inside `[offset, offset + duration)`.
    pub fn contains(&self, elapsed: f64) -> bool {
        self.offset_seconds <= elapsed && elapsed < self.end_seconds()
    }

    pub fn to_record(&self, delimiter: &str) -> String {
        format!(
            "{}{delimiter}{}{delimiter}{}",
            self.word, self.offset_seconds, self.duration_seconds
        )
    }
}

/// Parse one sidecar record.
pub fn parse_record(line: &str, delimiter: &str) -> Option<WordBoundary> {
    let line = line.trim_end_matches('\r');
    let parts: Vec<&str> = line.split(delimiter).collect();
    if parts.len() != 3 {
        return None;
    }
    let offset: f64 = parts[1].trim().parse().ok()?;
    let duration: f64 = parts[2].trim().parse().ok()?;
    if !offset.is_finite() || !duration.is_finite() || offset < 0.0 || duration < 0.0 {
        return None;
    }
    Some(WordBoundary::new(parts[0], offset, duration))
}

/// Parse a whole sidecar, keeping record order.
pub fn parse_sidecar(content: &str, delimiter: &str) -> Vec<WordBoundary> {
    if delimiter.is_empty() {
        return Vec::new();
    }
    content
        .split('\n')
        .filter_map(|line| parse_record(line, delimiter))
        .collect()
}

/// Render boundaries as sidecar text (newline-terminated records).
pub fn format_sidecar(boundaries: &[WordBoundary], delimiter: &str) -> String {
    let mut out = String::new();
    for b in boundaries {
        out.push_str(&b.to_record(delimiter));
        out.push('\n');
    }
    out
}

pub async fn write_sidecar(
    path: &Path,
    boundaries: &[WordBoundary],
    delimiter: &str,
) -> std::io::Result<()> {
    tokio::fs::write(path, format_sidecar(boundaries, delimiter)).await
}

/// Blocking read, used from the playback thread.
pub fn load_sidecar(path: &Path, delimiter: &str) -> std::io::Result<Vec<WordBoundary>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_sidecar(&content, delimiter))
}
