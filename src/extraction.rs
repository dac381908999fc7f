//! Renderable-fragment extraction.
//!
//! Shared by the completion validator and the render surface: given a
//! validated buffer, locate the actual markup to hand downstream. SVG is
//! preferred for covers and diagrams; HTML documents, bodies and balanced
//! `<div>` spans are accepted for everything else.

use crate::types::CardType;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FENCE_OPEN: Regex = Regex::new(r"```(?:svg|html)?[ \t]*\n?").unwrap();
    static ref FENCE_CLOSE: Regex = Regex::new(r"\n?```").unwrap();
    static ref GENERIC_TAG: Regex = Regex::new(r"<[a-zA-Z][a-zA-Z0-9-]*(\s[^>]*)?>").unwrap();
}

/// Extract the renderable markup fragment from generated content.
/// Returns None when nothing tag-shaped can be found at all.
pub fn extract_renderable(content: &str, card_type: CardType) -> Option<String> {
    let stripped = strip_fence_markers(content);
    let stripped = stripped.trim();

    if matches!(card_type, CardType::Cover | CardType::Diagram) {
        if let Some(svg) = extract_svg(stripped) {
            return Some(svg.to_string());
        }
    }

    if let Some(html) = extract_html(stripped) {
        return Some(html.to_string());
    }

    // Covers may still come back as SVG-less HTML; cards occasionally as SVG.
    if let Some(svg) = extract_svg(stripped) {
        return Some(svg.to_string());
    }

    // Last resort: the buffer is tag-shaped but has no structural root we
    // recognize. Hand back the whole thing.
    if GENERIC_TAG.is_match(stripped) {
        return Some(stripped.to_string());
    }

    None
}

/// Remove markdown fence markers while keeping the fenced content.
fn strip_fence_markers(content: &str) -> String {
    if !content.contains("```") {
        return content.to_string();
    }
    let once = FENCE_OPEN.replace_all(content, "");
    FENCE_CLOSE.replace_all(&once, "").into_owned()
}

/// First `<svg` to the matching last `</svg>`, found via last-index search.
fn extract_svg(content: &str) -> Option<&str> {
    let start = content.find("<svg")?;
    let close = content.rfind("</svg>")?;
    if close < start {
        return None;
    }
    Some(&content[start..close + "</svg>".len()])
}

fn extract_html(content: &str) -> Option<&str> {
    if let Some(start) = content.find("<html") {
        if let Some(close) = content.rfind("</html>") {
            if close > start {
                return Some(&content[start..close + "</html>".len()]);
            }
        }
    }
    if let Some(start) = content.find("<body") {
        if let Some(close) = content.rfind("</body>") {
            if close > start {
                return Some(&content[start..close + "</body>".len()]);
            }
        }
    }
    extract_balanced_div(content)
}

/// Balanced `<div>…</div>` span starting at the first opening div. Nested
/// divs are counted; a lazy first-close match would truncate the root.
fn extract_balanced_div(content: &str) -> Option<&str> {
    let start = content.find("<div")?;
    let mut depth: i32 = 0;
    let mut cursor = start;

    while cursor < content.len() {
        let next_open = content[cursor..].find("<div").map(|i| cursor + i);
        let next_close = content[cursor..].find("</div>").map(|i| cursor + i);
        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                cursor = o + "<div".len();
            }
            (_, Some(c)) => {
                depth -= 1;
                cursor = c + "</div>".len();
                if depth <= 0 {
                    return Some(&content[start..cursor]);
                }
            }
            (Some(o), None) => {
                depth += 1;
                cursor = o + "<div".len();
            }
            (None, None) => break,
        }
    }
    None
}
