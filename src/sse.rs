//! SSE frame parsing for upstream event streams.
//!
//! Converts raw byte chunks into discrete `data:` payloads. Chunk boundaries
//! carry no meaning: multi-byte UTF-8 sequences and records may be split
//! anywhere, so decoding and framing both keep carry-over state between
//! `feed` calls.

/// One framed SSE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` record, prefix stripped.
    Data(String),
    /// The literal `[DONE]` completion marker.
    Done,
}

#[derive(Debug, Default)]
pub struct SseFrameParser {
    /// Bytes not yet decodable (trailing partial UTF-8 sequence).
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a blank line.
    text: String,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every record completed by it.
    /// Partial records are retained for the next call, never dropped and
    /// never emitted twice.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(bytes);
        self.decode_pending(false);
        self.drain_complete_records()
    }

    /// Signal end of stream, flushing any trailing record that was not
    /// blank-line terminated.
    pub fn finish(&mut self) -> Vec<Frame> {
        self.decode_pending(true);
        let mut frames = self.drain_complete_records();
        if !self.text.trim().is_empty() {
            let tail = std::mem::take(&mut self.text);
            if let Some(frame) = Self::parse_record(&tail) {
                frames.push(frame);
            }
        } else {
            self.text.clear();
        }
        frames
    }

    /// Move decodable bytes from `pending` into `text`. A trailing
    /// incomplete sequence stays pending unless `eof`, in which case it is
    /// replaced (the stream died mid-character).
    fn decode_pending(&mut self, eof: bool) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: from_utf8 vouched for the prefix.
                    self.text
                        .push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or(""));
                    match e.error_len() {
                        Some(bad) => {
                            tracing::warn!(
                                "[SSE] Invalid UTF-8 sequence of {} byte(s) replaced",
                                bad
                            );
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence.
                            self.pending.drain(..valid);
                            if eof && !self.pending.is_empty() {
                                self.text.push(char::REPLACEMENT_CHARACTER);
                                self.pending.clear();
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_complete_records(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let lf = self.text.find("\n\n");
            let crlf = self.text.find("\r\n\r\n");
            let (idx, sep_len) = match (lf, crlf) {
                (Some(a), Some(b)) if b < a => (b, 4),
                (Some(a), _) => (a, 2),
                (None, Some(b)) => (b, 4),
                (None, None) => break,
            };
            let record: String = self.text[..idx].to_string();
            self.text.drain(..idx + sep_len);
            if let Some(frame) = Self::parse_record(&record) {
                frames.push(frame);
            }
        }
        frames
    }

    fn parse_record(record: &str) -> Option<Frame> {
        let mut data_lines: Vec<&str> = Vec::new();
        for line in record.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
            // Comment, `event:` and `id:` lines carry nothing we consume.
        }
        if data_lines.is_empty() {
            return None;
        }
        let payload = data_lines.join("\n");
        if payload == "[DONE]" {
            Some(Frame::Done)
        } else {
            Some(Frame::Data(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut SseFrameParser, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = parser.feed(bytes);
        frames.extend(parser.finish());
        frames
    }

    #[test]
    fn test_single_record() {
        let mut p = SseFrameParser::new();
        let frames = p.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(frames, vec![Frame::Data("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_done_marker_is_distinguished() {
        let mut p = SseFrameParser::new();
        let frames = p.feed(b"data: hello\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![Frame::Data("hello".to_string()), Frame::Done]
        );
    }

    #[test]
    fn test_partial_record_retained_not_double_emitted() {
        let mut p = SseFrameParser::new();
        assert!(p.feed(b"data: {\"choices\"").is_empty());
        let frames = p.feed(b":[]}\n\ndata: x");
        assert_eq!(frames, vec![Frame::Data("{\"choices\":[]}".to_string())]);
        let frames = p.feed(b"\n\n");
        assert_eq!(frames, vec![Frame::Data("x".to_string())]);
    }

    #[test]
    fn test_crlf_records() {
        let mut p = SseFrameParser::new();
        let frames = p.feed(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(
            frames,
            vec![Frame::Data("one".to_string()), Frame::Data("two".to_string())]
        );
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut p = SseFrameParser::new();
        let frames = p.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames, vec![Frame::Data("line1\nline2".to_string())]);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut p = SseFrameParser::new();
        let frames = p.feed(b": keep-alive\nevent: message\ndata: payload\n\n");
        assert_eq!(frames, vec![Frame::Data("payload".to_string())]);
    }

    #[test]
    fn test_finish_flushes_unterminated_record() {
        let mut p = SseFrameParser::new();
        assert!(p.feed(b"data: tail").is_empty());
        assert_eq!(p.finish(), vec![Frame::Data("tail".to_string())]);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut p = SseFrameParser::new();
        let record = "data: 知识卡片\n\n".as_bytes();
        // Split inside the first three-byte character.
        assert!(p.feed(&record[..8]).is_empty());
        let frames = p.feed(&record[8..]);
        assert_eq!(frames, vec![Frame::Data("知识卡片".to_string())]);
    }

    #[test]
    fn test_split_invariance_at_every_byte_offset() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"封面<svg \"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"width='10'></svg>\"}}]}\n\ndata: [DONE]\n\n".as_bytes();
        let mut reference = SseFrameParser::new();
        let expected = parse_all(&mut reference, stream);
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut p = SseFrameParser::new();
            let mut frames = p.feed(&stream[..split]);
            frames.extend(p.feed(&stream[split..]));
            frames.extend(p.finish());
            assert_eq!(frames, expected, "diverged at split offset {}", split);
        }
    }

    #[test]
    fn test_truncated_multibyte_at_eof_replaced() {
        let mut p = SseFrameParser::new();
        let bytes = "data: 图".as_bytes();
        assert!(p.feed(&bytes[..bytes.len() - 1]).is_empty());
        let frames = p.finish();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Data(s) => assert!(s.contains(char::REPLACEMENT_CHARACTER)),
            other => panic!("expected Data, got {:?}", other),
        }
    }
}
