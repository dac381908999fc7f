use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Error, Debug)]
pub enum CardforgeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Stream read timed out")]
    StreamTimeout,

    #[error("Stream ended with no generated content")]
    EmptyContent,

    #[error("Generated content is incomplete: {0}")]
    IncompleteContent(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

/// An error annotated with the span trace at the point it was observed.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: CardforgeError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<CardforgeError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, msg, code) = match &self.inner {
            CardforgeError::InvalidInput(m) => {
                (StatusCode::BAD_REQUEST, m.clone(), "INVALID_INPUT")
            }
            CardforgeError::TemplateNotFound(m) => {
                (StatusCode::NOT_FOUND, m.clone(), "TEMPLATE_NOT_FOUND")
            }
            CardforgeError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            CardforgeError::Network(e) => {
                (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR")
            }
            CardforgeError::Io(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "STREAM_READ_ERROR"),
            CardforgeError::StreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "upstream stream timed out".to_string(),
                "STREAM_TIMEOUT",
            ),
            CardforgeError::EmptyContent => (
                StatusCode::BAD_GATEWAY,
                "the model returned no content; try again or adjust the input".to_string(),
                "EMPTY_CONTENT",
            ),
            CardforgeError::IncompleteContent(m) => (
                StatusCode::BAD_GATEWAY,
                format!("generated content is incomplete ({}); try again", m),
                "INCOMPLETE_CONTENT",
            ),
            CardforgeError::Storage(m) => {
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone(), "STORAGE_ERROR")
            }
            CardforgeError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            CardforgeError::Internal(m, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone(), "INTERNAL_ERROR")
            }
        };
        (
            status,
            axum::Json(serde_json::json!({
                "success": false,
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

/// --- CARD DOMAIN ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Cover,
    Card,
    Diagram,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cover => write!(f, "cover"),
            Self::Card => write!(f, "card"),
            Self::Diagram => write!(f, "diagram"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
}

impl Default for Language {
    fn default() -> Self {
        Self::Zh
    }
}

/// Immutable input to a single generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub source_text: String,
    pub template_id: String,
    pub card_type: CardType,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The final validated payload of one generation request, immutable once
/// created. Ownership passes to the storage collaborator after handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub id: String,
    pub content: String,
    pub card_type: CardType,
    pub template_id: String,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Usage>,
}

/// Globally unique artifact id: millisecond timestamp plus a random
/// base36 suffix, never reused.
pub fn generate_artifact_id() -> String {
    let millis = Utc::now().timestamp_millis();
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let suffix: String = (0..7)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect();
    format!("card_{}_{}", millis, suffix)
}

/// One decoded SSE record, consumed immediately and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    UsageUpdate(Usage),
    FinishSignal(String),
    DoneSignal,
    Malformed(String),
}

/// --- PROVIDER WIRE TYPES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Outgoing chat-completion request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: u32,
}

/// One streamed chat-completion chunk. Providers frequently omit fields on
/// individual chunks, so everything defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Some gateways send the final non-streaming shape inside a chunk.
    pub message: Option<CompletionMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChunkDelta {
    pub content: Option<String>,
    pub role: Option<String>,
}

/// Buffered (non-streaming) chat-completion response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: String,
}

/// Error body shape used by OpenAI-compatible APIs.
#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    pub error: UpstreamErrorDetails,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamErrorDetails {
    pub message: String,
    pub code: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_parses_with_missing_fields() {
        // Usage-only chunks omit id, model and choices entirely.
        let json = r#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk: ChatChunk = serde_json::from_str(json).unwrap();
        assert!(chunk.id.is_empty());
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_chunk_parses_delta_content() {
        let json = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"<svg "}}]}"#;
        let chunk: ChatChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("<svg "));
    }

    #[test]
    fn test_artifact_id_shape() {
        let id = generate_artifact_id();
        assert!(id.starts_with("card_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 7);
        assert_ne!(generate_artifact_id(), generate_artifact_id());
    }

    #[test]
    fn test_chat_request_serializes_roles_lowercase() {
        let req = ChatRequest {
            model: "deepseek-chat".into(),
            messages: vec![ChatMessage {
                role: Role::System,
                content: "prompt".into(),
            }],
            stream: true,
            max_tokens: 2000,
        };
        let val = serde_json::to_value(&req).unwrap();
        assert_eq!(val["messages"][0]["role"], "system");
        assert_eq!(val["stream"], true);
    }
}
