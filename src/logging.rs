use crate::types::StreamEvent;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-cardforge-request-id";

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every HTTP request with a request id and wraps it in a span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %crate::str_utils::prefix_chars(&request_id, 8));
    next.run(req).instrument(span).await
}

/// Per-stream counters, logged once at stream end.
#[derive(Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub content_chars: usize,
    pub usage_updates: usize,
    pub malformed: usize,
    started: Option<Instant>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        self.frames += 1;
        match event {
            StreamEvent::ContentDelta(text) => self.content_chars += text.len(),
            StreamEvent::UsageUpdate(_) => self.usage_updates += 1,
            StreamEvent::Malformed(_) => self.malformed += 1,
            _ => {}
        }
    }

    pub fn log_summary(&self, request_id: &str, display_tokens: usize) {
        let latency = self
            .started
            .map(|s| s.elapsed())
            .unwrap_or_default();

        if self.malformed > 0 {
            warn!(
                "{}",
                format!(
                    "[STREAM END] Request {} recovered past {} malformed frame(s)",
                    request_id, self.malformed
                )
                .bold()
                .red()
            );
        }

        info!(
            "[STREAM END] Request: {} | Frames: {} | Text: {} chars | Usage updates: {} | Tokens: ~{} | Latency: {:?}",
            request_id, self.frames, self.content_chars, self.usage_updates, display_tokens, latency
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;

    #[test]
    fn test_stream_metric_counts_events() {
        let mut m = StreamMetric::new();
        m.record_event(&StreamEvent::ContentDelta("abcd".to_string()));
        m.record_event(&StreamEvent::UsageUpdate(Usage::default()));
        m.record_event(&StreamEvent::Malformed("junk".to_string()));
        m.record_event(&StreamEvent::DoneSignal);

        assert_eq!(m.frames, 4);
        assert_eq!(m.content_chars, 4);
        assert_eq!(m.usage_updates, 1);
        assert_eq!(m.malformed, 1);
    }
}
