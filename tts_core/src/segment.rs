//! Text segmentation into synthesis units.

use serde::{Deserialize, Serialize};

/// Boundary characters used when none are configured.
pub const DEFAULT_BOUNDARY_CHARS: [char; 6] = ['.', '?', '!', ';', ':', '\n'];

/// Paragraph streams longer than this with no blank line are re-split by sentence.
const PARAGRAPH_FALLBACK_LEN: usize = 200;

/// One span of input text treated as a single synthesis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUnit {
    pub index: usize,
    pub content: String,
}

impl TextUnit {
    pub fn new(index: usize, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
        }
    }
}

/// Split `text` into units, closing a unit each time a boundary character is
/// appended. Units are trimmed; units that trim to nothing are skipped so
/// indices stay dense over what is actually spoken.
pub fn segment(text: &str, boundary_chars: &[char]) -> Vec<TextUnit> {
    let mut units = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if boundary_chars.contains(&ch) {
            push_unit(&mut units, &current);
            current.clear();
        }
    }
    push_unit(&mut units, &current);

    units
}

fn push_unit(units: &mut Vec<TextUnit>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        let index = units.len();
        units.push(TextUnit::new(index, trimmed));
    }
}

/// Paragraph-level units for remote streaming. Splits on blank lines; a single
/// long paragraph falls back to [`segment`].
pub fn split_paragraphs(text: &str, boundary_chars: &[char]) -> Vec<TextUnit> {
    let normalized = text.replace("\r\n", "\n");
    let paragraphs: Vec<&str> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.len() == 1 && paragraphs[0].chars().count() > PARAGRAPH_FALLBACK_LEN {
        return segment(paragraphs[0], boundary_chars);
    }

    paragraphs
        .into_iter()
        .enumerate()
        .map(|(index, p)| TextUnit::new(index, p))
        .collect()
}
