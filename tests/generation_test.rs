use async_trait::async_trait;
use axum::body::Body;
use axum::http::header;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use cardforge::engine::{GenerationEngine, Phase, Progress, ProgressTap};
use cardforge::metrics::MetricsAggregator;
use cardforge::store::{ContentStore, FallbackStore, MemoryStore};
use cardforge::types::*;
use futures_util::stream;
use std::sync::Arc;
use std::time::Duration;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

fn sse_body(payloads: &[&str]) -> String {
    let mut out = String::new();
    for p in payloads {
        out.push_str("data: ");
        out.push_str(p);
        out.push_str("\n\n");
    }
    out.push_str("data: [DONE]\n\n");
    out
}

async fn sse_upstream(payloads: &[&str]) -> String {
    let body = sse_body(payloads);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = body.clone();
            async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }
        }),
    );
    serve(app).await
}

fn test_engine(
    url: String,
    store: Arc<dyn ContentStore>,
) -> (Arc<GenerationEngine>, Arc<MetricsAggregator>) {
    let metrics = Arc::new(MetricsAggregator::new());
    let engine = Arc::new(GenerationEngine::new(
        reqwest::Client::new(),
        "test-key".to_string(),
        url,
        2000,
        Some(Duration::from_secs(30)),
        store,
        metrics.clone(),
    ));
    (engine, metrics)
}

fn cover_request() -> GenerationRequest {
    GenerationRequest {
        source_text: "Ownership and borrowing in Rust".to_string(),
        template_id: "minimalist-cover".to_string(),
        card_type: CardType::Cover,
        language: Language::En,
        model_id: None,
    }
}

#[tokio::test]
async fn test_streaming_generation_end_to_end() {
    let url = sse_upstream(&[
        r#"{"choices":[{"delta":{"content":"<svg "}}]}"#,
        r#"{"choices":[{"delta":{"content":"width='10'></svg>"}}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        r#"{"usage":{"prompt_tokens":40,"completion_tokens":60,"total_tokens":100}}"#,
    ])
    .await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, _) = test_engine(url, store.clone());

    let (tap, mut progress_rx) = ProgressTap::channel();
    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.generate(cover_request(), tap).await })
    };

    let mut phases: Vec<Progress> = Vec::new();
    while let Some(p) = progress_rx.recv().await {
        phases.push(p);
    }
    let artifact = worker.await.unwrap().unwrap();

    assert_eq!(artifact.content, "<svg width='10'></svg>");
    assert_eq!(artifact.token_usage.as_ref().unwrap().total_tokens, 100);
    assert_eq!(artifact.template_id, "minimalist-cover");
    assert_eq!(artifact.template_name, "Minimalist Cover");

    // The artifact id is only returned after the store write acknowledged.
    let stored = store.get(&artifact.id).await.unwrap().unwrap();
    assert_eq!(stored.content, artifact.content);

    assert_eq!(phases.first().unwrap().phase, Phase::Requesting);
    assert_eq!(phases.last().unwrap().phase, Phase::Success);
    let streaming: Vec<&Progress> = phases
        .iter()
        .filter(|p| p.phase == Phase::Streaming)
        .collect();
    assert!(!streaming.is_empty());
    for pair in streaming.windows(2) {
        assert!(pair[1].tokens >= pair[0].tokens);
    }
}

#[tokio::test]
async fn test_buffered_fallback_shape() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(serde_json::json!({
                "choices": [{"message": {"content": "<div>buffered card</div>"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
            }))
        }),
    );
    let url = serve(app).await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, _) = test_engine(url, store.clone());

    let mut request = cover_request();
    request.template_id = "elegant-text-card".to_string();
    request.card_type = CardType::Card;

    let artifact = engine.generate(request, ProgressTap::disabled()).await.unwrap();
    assert_eq!(artifact.content, "<div>buffered card</div>");
    assert_eq!(artifact.token_usage.unwrap().total_tokens, 20);
    assert!(store.get(&artifact.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_upstream_error_surfaces_status_and_message() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": {"message": "model overloaded", "code": 500}})),
            )
        }),
    );
    let url = serve(app).await;
    let (engine, _) = test_engine(url, Arc::new(MemoryStore::new()));

    let err = engine
        .generate(cover_request(), ProgressTap::disabled())
        .await
        .unwrap_err();
    match &err.inner {
        CardforgeError::Upstream(status, message) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(message, "model overloaded");
        }
        other => panic!("expected Upstream, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_stream_fails_and_stores_nothing() {
    let url = sse_upstream(&[]).await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, metrics) = test_engine(url, store.clone());

    let err = engine
        .generate(cover_request(), ProgressTap::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err.inner, CardforgeError::EmptyContent));
    assert!(store.list_recent(10).await.unwrap().is_empty());

    let m = metrics.get_metrics("deepseek-chat").await.unwrap();
    assert_eq!(m.empty_streams, 1);
}

#[tokio::test]
async fn test_input_guards_reject_before_any_network_call() {
    // Unroutable endpoint: a network attempt would fail loudly, so passing
    // these guards proves no call was made.
    let (engine, _) = test_engine(
        "http://127.0.0.1:9/unroutable".to_string(),
        Arc::new(MemoryStore::new()),
    );

    let mut empty = cover_request();
    empty.source_text = "   ".to_string();
    let err = engine.generate(empty, ProgressTap::disabled()).await.unwrap_err();
    assert!(matches!(err.inner, CardforgeError::InvalidInput(_)));

    let mut unknown = cover_request();
    unknown.template_id = "no-such-template".to_string();
    let err = engine.generate(unknown, ProgressTap::disabled()).await.unwrap_err();
    match &err.inner {
        CardforgeError::TemplateNotFound(id) => assert_eq!(id, "no-such-template"),
        other => panic!("expected TemplateNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_frames_recovered_and_counted() {
    let url = sse_upstream(&[
        "%%junk that is not json and has no content key%%",
        r#"{"choices":[{"delta":{"content":"<svg viewBox='0 0 10 10'><rect/></svg>"}}]}"#,
    ])
    .await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, metrics) = test_engine(url, store.clone());

    let artifact = engine
        .generate(cover_request(), ProgressTap::disabled())
        .await
        .unwrap();
    assert_eq!(artifact.content, "<svg viewBox='0 0 10 10'><rect/></svg>");

    let m = metrics.get_metrics("deepseek-chat").await.unwrap();
    assert_eq!(m.streams, 1);
    assert_eq!(m.malformed_frames, 1);
}

#[tokio::test]
async fn test_fence_repair_recorded_and_stored_repaired() {
    let url = sse_upstream(&[
        r#"{"choices":[{"delta":{"content":"```html\n<div>knowledge card body</div>"}}]}"#,
    ])
    .await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, metrics) = test_engine(url, store.clone());

    let mut request = cover_request();
    request.template_id = "elegant-text-card".to_string();
    request.card_type = CardType::Card;

    let artifact = engine.generate(request, ProgressTap::disabled()).await.unwrap();
    // The repaired buffer is what gets stored.
    assert!(artifact.content.ends_with("```\n"));

    let m = metrics.get_metrics("deepseek-chat").await.unwrap();
    assert_eq!(m.fence_repairs, 1);
}

struct FailingStore;

#[async_trait]
impl ContentStore for FailingStore {
    async fn put(&self, _artifact: GeneratedArtifact) -> Result<()> {
        Err(CardforgeError::Storage("disk full".to_string()).into())
    }

    async fn get(&self, _id: &str) -> Result<Option<GeneratedArtifact>> {
        Err(CardforgeError::Storage("disk full".to_string()).into())
    }

    async fn list_recent(&self, _limit: usize) -> Result<Vec<GeneratedArtifact>> {
        Err(CardforgeError::Storage("disk full".to_string()).into())
    }
}

#[tokio::test]
async fn test_artifact_survives_failing_primary_store() {
    let url = sse_upstream(&[r#"{"choices":[{"delta":{"content":"<svg width='10'></svg>"}}]}"#]).await;
    let store: Arc<dyn ContentStore> = Arc::new(FallbackStore::new(Arc::new(FailingStore)));
    let (engine, _) = test_engine(url, store.clone());

    let artifact = engine
        .generate(cover_request(), ProgressTap::disabled())
        .await
        .unwrap();
    let recovered = store.get(&artifact.id).await.unwrap().unwrap();
    assert_eq!(recovered.content, "<svg width='10'></svg>");
}

#[tokio::test]
async fn test_dropping_progress_receiver_cancels_the_read() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let chunks = stream::unfold(0u32, |i| async move {
                match i {
                    0 => Some((
                        Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(
                            b"data: {\"choices\":[{\"delta\":{\"content\":\"<div>x\"}}]}\n\n",
                        )),
                        1,
                    )),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Some((
                            Ok(Bytes::from_static(
                                b"data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n\n",
                            )),
                            2,
                        ))
                    }
                    2 => {
                        // Never delivered unless the consumer fails to cancel.
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Some((Ok(Bytes::from_static(b"data: [DONE]\n\n")), 3))
                    }
                    _ => None,
                }
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(chunks),
            )
        }),
    );
    let url = serve(app).await;
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let (engine, _) = test_engine(url, store.clone());

    let (tap, mut progress_rx) = ProgressTap::channel();
    let started = std::time::Instant::now();
    let worker = {
        let engine = engine.clone();
        let mut request = cover_request();
        request.template_id = "elegant-text-card".to_string();
        request.card_type = CardType::Card;
        tokio::spawn(async move { engine.generate(request, tap).await })
    };

    // Walk away after the first streaming update.
    while let Some(p) = progress_rx.recv().await {
        if p.phase == Phase::Streaming {
            break;
        }
    }
    drop(progress_rx);

    let err = worker.await.unwrap().unwrap_err();
    assert!(matches!(err.inner, CardforgeError::IncompleteContent(_)));
    assert!(store.list_recent(10).await.unwrap().is_empty());
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "read loop did not stop after cancellation"
    );
}
