//! HTTP request handlers

use crate::engine::{ChatReply, Engine, EngineResponse};
use crate::error::ApiError;
use crate::streaming::{chat_event_stream, ndjson_response};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use batchloop_common::{BatchLoopError, METRICS};
use batchloop_proto::ChatCompletionRequest;
use bytes::Bytes;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Plain predict endpoint
pub async fn predict(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let engine = &state.engine;

    let response = match engine.handle_request(&body, engine.is_streaming()).await? {
        EngineResponse::Complete(body) => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        EngineResponse::Stream(lines) => ndjson_response(lines),
    };

    Ok(response)
}

/// Chat completion endpoint
pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|e| {
        BatchLoopError::malformed_input(format!("invalid chat completion request: {}", e))
    })?;

    let response = match state.engine.chat(request).await? {
        ChatReply::Complete(response) => (StatusCode::OK, Json(response)).into_response(),
        ChatReply::Stream(chunks) => chat_event_stream(chunks).into_response(),
    };

    Ok(response)
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.engine.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
}
