//! Generation engine.
//!
//! Drives one generation attempt end to end: template lookup, the upstream
//! chat-completion call, the streaming read loop, validation and repair, and
//! the storage handoff. The upstream response shape is decided exactly once
//! at the API boundary; downstream code pattern-matches on it instead of
//! probing fields.

use crate::accumulator::{decode_frame, AccumulationState};
use crate::constants::{DEFAULT_MODEL_ID, MAX_STREAM_FRAMES, PROGRESS_CHANNEL_CAPACITY};
use crate::logging::StreamMetric;
use crate::metrics::MetricsAggregator;
use crate::sse::{Frame, SseFrameParser};
use crate::store::ContentStore;
use crate::templates::template_by_id;
use crate::types::*;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;
use tracing_error::SpanTrace;

/// UI-visible phase of one generation attempt.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Requesting,
    Streaming,
    Validating,
    Success,
    Failed,
}

/// One progress update, emitted per received chunk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub tokens: usize,
    pub chunks: usize,
}

/// Per-request progress emitter. Updates are fire-and-forget: a full channel
/// drops them, a closed receiver is the cancellation signal that stops the
/// read loop. One tap per request; nothing here is shared across requests.
pub struct ProgressTap {
    tx: Option<mpsc::Sender<Progress>>,
}

impl ProgressTap {
    pub fn channel() -> (Self, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// A tap nobody listens to. Never signals cancellation.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Returns false once the receiver is gone.
    pub fn emit(&self, progress: Progress) -> bool {
        match &self.tx {
            Some(tx) => match tx.try_send(progress) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => true,
        }
    }
}

/// Upstream response shape, decided once by content type.
enum UpstreamResponse {
    Streaming(reqwest::Response),
    Buffered(ChatCompletion),
}

pub struct GenerationEngine {
    client: reqwest::Client,
    api_key: String,
    chat_url: String,
    max_tokens: u32,
    /// Per-read deadline on the upstream stream. None disables it.
    read_timeout: Option<Duration>,
    store: Arc<dyn ContentStore>,
    metrics: Arc<MetricsAggregator>,
}

impl GenerationEngine {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        chat_url: String,
        max_tokens: u32,
        read_timeout: Option<Duration>,
        store: Arc<dyn ContentStore>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            client,
            api_key,
            chat_url,
            max_tokens,
            read_timeout,
            store,
            metrics,
        }
    }

    /// Run one generation attempt. The returned artifact has already been
    /// written to the store; its id is only handed back after the write
    /// acknowledges.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        tap: ProgressTap,
    ) -> Result<GeneratedArtifact> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "generate",
            rid = %crate::str_utils::prefix_chars(&request_id, 8),
            template = %request.template_id,
        );

        let result = self.run(&request, &request_id, &tap).instrument(span).await;
        if let Err(e) = &result {
            tracing::error!("[ENGINE] Generation failed: {}", e.inner);
            tap.emit(Progress {
                phase: Phase::Failed,
                tokens: 0,
                chunks: 0,
            });
        }
        result
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        request_id: &str,
        tap: &ProgressTap,
    ) -> Result<GeneratedArtifact> {
        if request.source_text.trim().is_empty() {
            return Err(CardforgeError::InvalidInput("source text is empty".to_string()).into());
        }
        let template = template_by_id(&request.template_id)
            .ok_or_else(|| CardforgeError::TemplateNotFound(request.template_id.clone()))?;

        tap.emit(Progress {
            phase: Phase::Requesting,
            tokens: 0,
            chunks: 0,
        });

        let model = request
            .model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());

        let body = ChatRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: template.prompt(request.language).to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: request.source_text.clone(),
                },
            ],
            stream: true,
            max_tokens: self.max_tokens,
        };

        tracing::info!("[ENGINE] Calling upstream model {}", model);
        let response = self
            .client
            .post(&self.chat_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            let message = serde_json::from_str::<UpstreamErrorBody>(&error_body)
                .map(|b| b.error.message)
                .unwrap_or(error_body);
            tracing::error!("[ENGINE] Upstream error {}: {}", status, message);
            return Err(CardforgeError::Upstream(status, message).into());
        }

        let (state, received_end) = match Self::decide_shape(response).await? {
            UpstreamResponse::Streaming(resp) => {
                let state = self.consume_stream(resp, request_id, tap).await?;
                let end = state.received_end_signal();
                (state, end)
            }
            UpstreamResponse::Buffered(completion) => {
                // Deployments that buffer responses deliver the whole body in
                // one JSON object; the accumulator's frame path is skipped.
                tracing::info!("[ENGINE] Upstream returned a buffered completion");
                let mut state = AccumulationState::new();
                if let Some(choice) = completion.choices.first() {
                    if !choice.message.content.is_empty() {
                        state.apply(StreamEvent::ContentDelta(choice.message.content.clone()));
                    }
                    if let Some(reason) = &choice.finish_reason {
                        state.apply(StreamEvent::FinishSignal(reason.clone()));
                    }
                }
                if let Some(usage) = completion.usage {
                    state.apply(StreamEvent::UsageUpdate(usage));
                }
                (state, true)
            }
        };

        tap.emit(Progress {
            phase: Phase::Validating,
            tokens: state.display_tokens(),
            chunks: state.chunk_count,
        });
        self.metrics
            .record_stream(&model, state.malformed_count as u64)
            .await;

        let validated =
            match crate::validation::validate_completion(&state.buffer, request.card_type, received_end)
            {
                Ok(v) => v,
                Err(e) => {
                    match &e {
                        CardforgeError::EmptyContent => {
                            self.metrics.record_empty_stream(&model).await
                        }
                        CardforgeError::IncompleteContent(_) => {
                            self.metrics.record_incomplete_stream(&model).await
                        }
                        _ => {}
                    }
                    return Err(e.into());
                }
            };
        if validated.repaired {
            self.metrics.record_fence_repair(&model).await;
        }

        let template_name = match request.language {
            Language::Zh => template.name,
            Language::En => template.name_en,
        };
        let artifact = GeneratedArtifact {
            id: generate_artifact_id(),
            content: validated.content,
            card_type: request.card_type,
            template_id: template.id.to_string(),
            template_name: template_name.to_string(),
            created_at: Utc::now(),
            token_usage: state.usage.clone(),
        };

        self.store.put(artifact.clone()).await?;
        tracing::info!(
            "[ENGINE] Stored artifact {} ({} chars, ~{} tokens)",
            artifact.id,
            artifact.content.len(),
            state.display_tokens()
        );
        tap.emit(Progress {
            phase: Phase::Success,
            tokens: state.display_tokens(),
            chunks: state.chunk_count,
        });
        Ok(artifact)
    }

    async fn decide_shape(response: reqwest::Response) -> Result<UpstreamResponse> {
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.starts_with("text/event-stream") {
            Ok(UpstreamResponse::Streaming(response))
        } else {
            let completion: ChatCompletion = response.json().await?;
            Ok(UpstreamResponse::Buffered(completion))
        }
    }

    /// Sequentially consume the SSE body. Single reader per stream; the body
    /// is dropped (and the connection released) on every exit path,
    /// including timeouts and cancellation.
    async fn consume_stream(
        &self,
        response: reqwest::Response,
        request_id: &str,
        tap: &ProgressTap,
    ) -> Result<AccumulationState> {
        let mut body = response.bytes_stream();
        let mut parser = SseFrameParser::new();
        let mut state = AccumulationState::new();
        let mut metric = StreamMetric::new();
        let mut frame_count = 0usize;

        while !state.received_done {
            let next = match self.read_timeout {
                Some(deadline) => match tokio::time::timeout(deadline, body.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        tracing::error!("[ENGINE] Upstream stalled past {:?}", deadline);
                        return Err(CardforgeError::StreamTimeout.into());
                    }
                },
                None => body.next().await,
            };
            let Some(chunk) = next else { break };
            let bytes: Bytes = chunk?;

            for frame in parser.feed(&bytes) {
                frame_count += 1;
                Self::ingest_frame(frame, frame_count, &mut state, &mut metric)?;
            }

            let alive = tap.emit(Progress {
                phase: Phase::Streaming,
                tokens: state.display_tokens(),
                chunks: state.chunk_count,
            });
            if !alive {
                tracing::info!("[ENGINE] Progress receiver closed; stopping the read");
                break;
            }
        }

        if !state.received_done {
            for frame in parser.finish() {
                frame_count += 1;
                Self::ingest_frame(frame, frame_count, &mut state, &mut metric)?;
            }
        }

        metric.log_summary(request_id, state.display_tokens());
        Ok(state)
    }

    fn ingest_frame(
        frame: Frame,
        frame_count: usize,
        state: &mut AccumulationState,
        metric: &mut StreamMetric,
    ) -> Result<()> {
        if frame_count > MAX_STREAM_FRAMES {
            return Err(CardforgeError::Internal(
                format!("stream exceeded max frame limit ({})", MAX_STREAM_FRAMES),
                SpanTrace::capture(),
            )
            .into());
        }
        match frame {
            Frame::Done => {
                let event = StreamEvent::DoneSignal;
                metric.record_event(&event);
                state.apply(event);
            }
            Frame::Data(payload) => {
                for event in decode_frame(&payload) {
                    metric.record_event(&event);
                    state.apply(event);
                }
            }
        }
        Ok(())
    }
}
