use cardforge::engine::{GenerationEngine, ProgressTap};
use cardforge::logging::request_id_middleware;
use cardforge::metrics::MetricsAggregator;
use cardforge::store::{ContentStore, FallbackStore, FileStore, MemoryStore};
use cardforge::templates::{templates_by_type, TEMPLATES};
use cardforge::*;

use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::{Path, Query, State},
    http as ax_http, middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing_subscriber::prelude::*;

// --- API HANDLERS ---

#[derive(Debug, Deserialize)]
struct GenerateCardBody {
    text: String,
    template_id: String,
    #[serde(rename = "type")]
    card_type: CardType,
    #[serde(default)]
    language: Language,
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

async fn generate_card(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateCardBody>,
) -> Response {
    let request = GenerationRequest {
        source_text: body.text,
        template_id: body.template_id,
        card_type: body.card_type,
        language: body.language,
        model_id: body.model,
    };

    if body.stream {
        stream_generation(state, request).into_response()
    } else {
        match state.engine.generate(request, ProgressTap::disabled()).await {
            Ok(artifact) => Json(serde_json::json!({
                "success": true,
                "id": artifact.id,
                "content": artifact.content,
                "token_usage": artifact.token_usage,
            }))
            .into_response(),
            Err(e) => e.into_response(),
        }
    }
}

/// SSE progress frames ending with a `result` or `error` frame, then the
/// `[DONE]` marker. Dropping the client connection cancels the upstream read.
fn stream_generation(
    state: Arc<AppState>,
    request: GenerationRequest,
) -> Sse<ReceiverStream<std::result::Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = mpsc::channel(cardforge::constants::PROGRESS_CHANNEL_CAPACITY);
    let (tap, mut progress_rx) = ProgressTap::channel();
    let engine = state.engine.clone();

    tokio::spawn(async move {
        let worker = tokio::spawn(async move { engine.generate(request, tap).await });

        while let Some(progress) = progress_rx.recv().await {
            let event = match Event::default().event("progress").json_data(&progress) {
                Ok(ev) => ev,
                Err(_) => continue,
            };
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
        // Either the engine finished (tap dropped) or the client went away.
        // Dropping the receiver is what stops an in-flight read loop.
        drop(progress_rx);

        let final_event = match worker.await {
            Ok(Ok(artifact)) => Event::default().event("result").json_data(serde_json::json!({
                "success": true,
                "id": artifact.id,
                "token_usage": artifact.token_usage,
            })),
            Ok(Err(e)) => Event::default().event("error").json_data(serde_json::json!({
                "success": false,
                "error": e.inner.to_string(),
            })),
            Err(join_err) => {
                tracing::error!("[API] Generation task failed: {}", join_err);
                Event::default().event("error").json_data(serde_json::json!({
                    "success": false,
                    "error": "generation task failed",
                }))
            }
        };
        if let Ok(ev) = final_event {
            let _ = tx.send(Ok(ev)).await;
        }
        let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text(": keepalive"),
    )
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    limit: Option<usize>,
}

async fn recent_cards(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(cardforge::constants::MAX_RECENT_ITEMS);
    match state.store.list_recent(limit).await {
        Ok(cards) => Json(cards).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_card(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Ok(Some(artifact)) => Json(artifact).into_response(),
        Ok(None) => (
            ax_http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "card not found" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Render surface: the stored content reduced to its renderable fragment,
/// served with a markup content type.
async fn render_card(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let artifact = match state.store.get(&id).await {
        Ok(Some(a)) => a,
        Ok(None) => {
            return (ax_http::StatusCode::NOT_FOUND, "card not found").into_response();
        }
        Err(e) => return e.into_response(),
    };

    match cardforge::extraction::extract_renderable(&artifact.content, artifact.card_type) {
        Some(markup) => {
            let content_type = if markup.starts_with("<svg") {
                "image/svg+xml"
            } else {
                "text/html; charset=utf-8"
            };
            (
                ax_http::StatusCode::OK,
                [(ax_http::header::CONTENT_TYPE, content_type)],
                markup,
            )
                .into_response()
        }
        None => (
            ax_http::StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "stored content is not renderable" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TemplateParams {
    #[serde(rename = "type")]
    card_type: Option<CardType>,
}

async fn list_templates(Query(params): Query<TemplateParams>) -> Response {
    match params.card_type {
        Some(ty) => Json(templates_by_type(ty)).into_response(),
        None => Json(TEMPLATES.iter().collect::<Vec<_>>()).into_response(),
    }
}

async fn stream_metrics(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.get_all_metrics().await).into_response()
}

// --- STARTUP ---

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "cardforge=debug".into(),
    };

    let _ = std::fs::create_dir_all("logs");
    let file_appender = tracing_appender::rolling::daily("logs", "cardforge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    cardforge::logging::setup_panic_hook();

    let args = Args::parse();

    let api_key = match std::env::var("CARDFORGE_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: CARDFORGE_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let primary: Arc<dyn ContentStore> = if args.memory_store {
        tracing::info!("Using in-memory card store");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!("Using file card store under {}", args.data_dir);
        Arc::new(FileStore::new(&args.data_dir))
    };
    let store: Arc<dyn ContentStore> = Arc::new(FallbackStore::new(primary));

    let metrics = Arc::new(MetricsAggregator::new());
    let read_timeout = if args.stream_read_timeout_secs > 0 {
        Some(Duration::from_secs(args.stream_read_timeout_secs))
    } else {
        None
    };

    let engine = Arc::new(GenerationEngine::new(
        client,
        api_key,
        args.chat_completions_url.clone(),
        args.max_tokens,
        read_timeout,
        store.clone(),
        metrics.clone(),
    ));

    let state = Arc::new(AppState {
        engine,
        store,
        metrics: metrics.clone(),
        upstream_configured: true,
    });

    // Periodic stream-health summary in the logs.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(600));
        tick.tick().await;
        loop {
            tick.tick().await;
            metrics.log_summary().await;
        }
    });

    let app = Router::new()
        .route("/api/cards", post(generate_card))
        .route("/api/cards/recent", get(recent_cards))
        .route("/api/cards/:id", get(get_card))
        .route("/api/cards/:id/render", get(render_card))
        .route("/api/templates", get(list_templates))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/admin/metrics", get(stream_metrics))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Cardforge listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
