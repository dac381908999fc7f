//! Completion validation and bounded structural repair.
//!
//! Decides whether an accumulated buffer is a usable artifact once the
//! stream ends. Repairs are syntactic only (closing an unterminated markdown
//! fence); nothing here validates the semantics of the enclosed markup.

use crate::constants::{FENCE_MARKER, MIN_PLAUSIBLE_CONTENT_LEN, ROOT_MARKERS};
use crate::types::{CardType, CardforgeError};
use colored::Colorize;

/// A buffer that passed validation, possibly after repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedContent {
    pub content: String,
    pub repaired: bool,
}

/// Validate an accumulated buffer, attempting repair before giving up.
/// `received_end` reports whether the stream delivered an explicit finish
/// or `[DONE]` signal before closing.
pub fn validate_completion(
    buffer: &str,
    card_type: CardType,
    received_end: bool,
) -> Result<ValidatedContent, CardforgeError> {
    if buffer.trim().is_empty() {
        return Err(CardforgeError::EmptyContent);
    }

    let mut content = buffer.to_string();
    let mut repaired = false;

    let flags = truncation_flags(&content, received_end);
    if !flags.is_empty() {
        tracing::warn!(
            "{} {}",
            "[VALIDATE] Possibly incomplete:".yellow(),
            flags.join("; ")
        );
        if let Some(patched) = repair_fences(&content) {
            tracing::info!(
                "[VALIDATE] Applied fence repair ({} -> {} chars)",
                content.len(),
                patched.len()
            );
            content = patched;
            repaired = true;
        }
        let remaining = truncation_flags(&content, received_end);
        if !remaining.is_empty() {
            return Err(CardforgeError::IncompleteContent(remaining.join("; ")));
        }
    }

    check_root(&content, card_type)?;
    Ok(ValidatedContent { content, repaired })
}

/// Heuristics that indicate the model output was cut off. Any hit flags the
/// buffer as possibly incomplete.
fn truncation_flags(content: &str, received_end: bool) -> Vec<&'static str> {
    let mut flags = Vec::new();

    let fence_count = content.matches(FENCE_MARKER).count();
    if fence_count % 2 == 1 {
        flags.push("odd number of code-fence markers");
    }
    if content.ends_with(FENCE_MARKER) {
        flags.push("buffer ends at a fence marker with no trailing newline");
    }
    if has_unclosed_html_fence(content) {
        flags.push("opened ```html fence is never closed");
    }
    if !received_end && content.len() < MIN_PLAUSIBLE_CONTENT_LEN {
        flags.push("stream ended without a finish signal and buffer is implausibly small");
    }

    flags
}

fn has_unclosed_html_fence(content: &str) -> bool {
    match content.find("```html") {
        Some(open) => !content[open + "```html".len()..].contains(FENCE_MARKER),
        None => false,
    }
}

/// Best-effort syntactic patch: close a single unterminated fenced block, or
/// terminate a fence marker the buffer stops at. Returns None when there is
/// nothing fence-shaped to fix.
fn repair_fences(content: &str) -> Option<String> {
    let fence_count = content.matches(FENCE_MARKER).count();
    if fence_count % 2 == 1 {
        return Some(format!("{}\n```\n", content));
    }
    if content.ends_with(FENCE_MARKER) {
        return Some(format!("{}\n", content));
    }
    None
}

/// The buffer must contain a recognized root marker, and the renderable
/// fragment must be locatable. An SVG whose closing tag cannot be found is
/// still accepted when the buffer is non-trivial in size.
fn check_root(content: &str, card_type: CardType) -> Result<(), CardforgeError> {
    if !ROOT_MARKERS.iter().any(|m| content.contains(m)) {
        return Err(CardforgeError::IncompleteContent(
            "no recognized SVG or HTML root element".to_string(),
        ));
    }

    if content.contains("<svg")
        && content.rfind("</svg>").is_none()
        && content.len() < MIN_PLAUSIBLE_CONTENT_LEN
    {
        return Err(CardforgeError::IncompleteContent(
            "unterminated <svg> root".to_string(),
        ));
    }

    if crate::extraction::extract_renderable(content, card_type).is_none() {
        return Err(CardforgeError::IncompleteContent(
            "no renderable fragment could be extracted".to_string(),
        ));
    }

    Ok(())
}
