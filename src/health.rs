use crate::main_helper::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub upstream_key: String,
    pub store: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let key_ok = state.upstream_configured;
    if !key_ok {
        tracing::error!("Readiness check: upstream API key missing");
    }

    // Probe the store with a cheap read.
    let store_ok = match state.store.list_recent(1).await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Readiness check: store error: {}", e.inner);
            false
        }
    };

    let status_code = if key_ok && store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if key_ok && store_ok { "ready" } else { "unready" }.to_string(),
            upstream_key: if key_ok { "ok" } else { "missing" }.to_string(),
            store: if store_ok { "ok" } else { "error" }.to_string(),
        }),
    )
}
