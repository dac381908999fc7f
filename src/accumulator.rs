//! Delta accumulation for streamed chat-completion chunks.
//!
//! Each framed payload is decoded into `StreamEvent`s on a strict serde path
//! first. Providers occasionally emit frames that are not valid JSON
//! (truncated mid-string, unescaped structural characters); those fall back
//! to pattern-based recovery of the `"content"` value so a single bad frame
//! never aborts the stream.

use crate::constants::MAX_FRAME_BYTES;
use crate::token_counting::TokenEstimator;
use crate::types::{ChatChunk, StreamEvent, Usage};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CONTENT_KEY: Regex = Regex::new(r#""content"\s*:\s*""#).unwrap();
}

/// Decode one `data:` payload into the events it carries. A single chunk can
/// hold content, usage and a finish reason at once.
pub fn decode_frame(payload: &str) -> Vec<StreamEvent> {
    if payload.len() > MAX_FRAME_BYTES {
        tracing::warn!("[ACCUM] Frame too large: {} bytes", payload.len());
        return vec![StreamEvent::Malformed(payload.to_string())];
    }

    match try_strict_parse(payload) {
        Some(events) => {
            if events.is_empty() {
                // Valid JSON carrying nothing we consume (role announcements,
                // keepalives, provider error bodies). Not malformed.
                tracing::debug!(
                    "[ACCUM] Frame carried no content/usage/finish: {}",
                    crate::str_utils::prefix_chars(payload, 120)
                );
            }
            events
        }
        None => match try_fallback_extract(payload) {
            Some(content) => {
                tracing::debug!(
                    "[ACCUM] Recovered {} chars of content from malformed frame",
                    content.len()
                );
                vec![StreamEvent::ContentDelta(content)]
            }
            None => vec![StreamEvent::Malformed(payload.to_string())],
        },
    }
}

/// Strict path: parse the OpenAI-compatible chunk shape. Returns None when
/// the payload is not valid JSON; an empty Vec when it parsed but carried
/// nothing we consume.
fn try_strict_parse(payload: &str) -> Option<Vec<StreamEvent>> {
    let chunk: ChatChunk = serde_json::from_str(payload).ok()?;
    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.first() {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::ContentDelta(content.clone()));
            }
        } else if let Some(message) = &choice.message {
            // Final non-streaming shape delivered inside a chunk.
            if !message.content.is_empty() {
                events.push(StreamEvent::ContentDelta(message.content.clone()));
            }
        }
        if let Some(reason) = &choice.finish_reason {
            events.push(StreamEvent::FinishSignal(reason.clone()));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::UsageUpdate(usage));
    }
    Some(events)
}

/// Fallback path: recover a `"content": "..."` value from a payload that is
/// not well-formed JSON, tolerating a missing closing quote. Never panics.
fn try_fallback_extract(payload: &str) -> Option<String> {
    let m = CONTENT_KEY.find(payload)?;
    let rest = &payload[m.end()..];

    let mut raw = String::new();
    let mut escaped = false;
    for c in rest.chars() {
        if escaped {
            raw.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                raw.push(c);
                escaped = true;
            }
            '"' => break,
            _ => raw.push(c),
        }
    }
    if raw.is_empty() {
        return None;
    }
    Some(unescape_json_string(&raw))
}

/// Manual JSON string unescape for recovered fragments. Unknown escapes are
/// kept literally; lone surrogates become U+FFFD.
pub fn unescape_json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('u') => match read_hex4(&mut chars) {
                Some(hi @ 0xD800..=0xDBFF) => {
                    // Expect a low surrogate to follow as \uXXXX.
                    let lo = if chars.peek() == Some(&'\\') {
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.next() == Some('u') {
                            match read_hex4(&mut ahead) {
                                Some(lo @ 0xDC00..=0xDFFF) => {
                                    chars = ahead;
                                    Some(lo)
                                }
                                _ => None,
                            }
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    match lo {
                        Some(lo) => {
                            let combined =
                                0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
                            out.push(
                                char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER),
                            );
                        }
                        None => out.push(char::REPLACEMENT_CHARACTER),
                    }
                }
                Some(code) => {
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                None => out.push_str("\\u"),
            },
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => {}
        }
    }
    out
}

fn read_hex4(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<u32> {
    let mut code = 0u32;
    for _ in 0..4 {
        let d = chars.peek()?.to_digit(16)?;
        chars.next();
        code = code * 16 + d;
    }
    Some(code)
}

/// Mutable, single-owner state of one in-flight generation. Created at
/// stream start and frozen into an artifact at stream end; the buffer only
/// grows until then.
#[derive(Debug, Default)]
pub struct AccumulationState {
    pub buffer: String,
    pub estimated_tokens: usize,
    pub usage: Option<Usage>,
    pub received_finish: bool,
    pub received_done: bool,
    pub chunk_count: usize,
    pub malformed_count: usize,
}

impl AccumulationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::ContentDelta(text) => {
                // Advance the estimate per fragment; recomputing the whole
                // buffer on every chunk would be quadratic.
                self.estimated_tokens += TokenEstimator::estimate_text_tokens(&text);
                self.buffer.push_str(&text);
                self.chunk_count += 1;
            }
            StreamEvent::UsageUpdate(usage) => {
                self.usage = Some(usage);
            }
            StreamEvent::FinishSignal(reason) => {
                tracing::debug!("[ACCUM] Finish reason: {}", reason);
                self.received_finish = true;
            }
            StreamEvent::DoneSignal => {
                self.received_done = true;
            }
            StreamEvent::Malformed(raw) => {
                self.malformed_count += 1;
                tracing::warn!(
                    "[ACCUM] Discarding malformed frame ({} bytes): {}",
                    raw.len(),
                    crate::str_utils::prefix_chars(&raw, 120)
                );
            }
        }
    }

    /// Token count to surface in the UI: authoritative usage wins over the
    /// running estimate.
    pub fn display_tokens(&self) -> usize {
        match &self.usage {
            Some(u) => u.total_tokens as usize,
            None => self.estimated_tokens,
        }
    }

    /// The stream delivered an explicit end signal of either kind.
    pub fn received_end_signal(&self) -> bool {
        self.received_finish || self.received_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_concatenation_in_arrival_order() {
        let mut state = AccumulationState::new();
        for payload in [
            r#"{"choices":[{"delta":{"content":"<svg "}}]}"#,
            r#"{"choices":[{"delta":{"content":"width='10'>"}}]}"#,
            r#"{"choices":[{"delta":{"content":"</svg>"}}]}"#,
        ] {
            for ev in decode_frame(payload) {
                state.apply(ev);
            }
        }
        assert_eq!(state.buffer, "<svg width='10'></svg>");
        assert_eq!(state.chunk_count, 3);
    }

    #[test]
    fn test_truncated_frame_recovers_content() {
        let events = decode_frame(r#"{"choices":[{"delta":{"content":"ab"#);
        assert_eq!(events, vec![StreamEvent::ContentDelta("ab".to_string())]);
    }

    #[test]
    fn test_unparseable_frame_is_malformed_not_fatal() {
        let events = decode_frame("not json at all");
        assert!(matches!(events[0], StreamEvent::Malformed(_)));
        let mut state = AccumulationState::new();
        for ev in events {
            state.apply(ev);
        }
        assert_eq!(state.malformed_count, 1);
        assert!(state.buffer.is_empty());
    }

    #[test]
    fn test_usage_overrides_estimate() {
        let mut state = AccumulationState::new();
        state.apply(StreamEvent::ContentDelta("hello world".to_string()));
        assert_eq!(state.display_tokens(), 11);
        state.apply(StreamEvent::UsageUpdate(Usage {
            prompt_tokens: 40,
            completion_tokens: 60,
            total_tokens: 100,
        }));
        assert_eq!(state.display_tokens(), 100);
    }

    #[test]
    fn test_finish_reason_sets_flag() {
        let mut state = AccumulationState::new();
        for ev in decode_frame(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#) {
            state.apply(ev);
        }
        assert!(state.received_finish);
        assert!(state.received_end_signal());
    }

    #[test]
    fn test_message_content_shape_accepted() {
        let events =
            decode_frame(r#"{"choices":[{"message":{"content":"<div>x</div>"}}]}"#);
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta("<div>x</div>".to_string())]
        );
    }

    #[test]
    fn test_usage_only_frame() {
        let events = decode_frame(
            r#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::UsageUpdate(u) => assert_eq!(u.total_tokens, 15),
            other => panic!("expected UsageUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_unescapes_standard_escapes() {
        let events = decode_frame(r#"{"choices":[{"delta":{"content":"a\n\"b\"\t\\c"#);
        assert_eq!(
            events,
            vec![StreamEvent::ContentDelta("a\n\"b\"\t\\c".to_string())]
        );
    }

    #[test]
    fn test_unescape_unicode_and_surrogates() {
        assert_eq!(unescape_json_string(r"\u4e2d\u6587"), "中文");
        assert_eq!(unescape_json_string(r"\ud83d\ude00"), "😀");
        assert_eq!(
            unescape_json_string(r"\ud83d"),
            char::REPLACEMENT_CHARACTER.to_string()
        );
        assert_eq!(unescape_json_string(r"ok \q"), "ok \\q");
    }

    #[test]
    fn test_estimate_advances_per_fragment() {
        let mut state = AccumulationState::new();
        state.apply(StreamEvent::ContentDelta("知识".to_string()));
        state.apply(StreamEvent::ContentDelta("ab".to_string()));
        assert_eq!(state.estimated_tokens, 6);
    }
}
