use crate::api::AppState;
use crate::delivery::item::{Metadata, OutboundItem};
use crate::delivery::outbound::{OutboundQueue, SendOutcome};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::service::ServiceStats;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Liveness, also used as the registry health check
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.service.uptime_seconds(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Ready once every captured stream was replayed
pub async fn readiness(State(state): State<AppState>) -> Result<Json<ReadyResponse>> {
    if !state.service.is_ready() {
        return Err(AppError::NotReady("events are still being replayed".to_string()));
    }

    Ok(Json(ReadyResponse {
        status: "ready".to_string(),
        streams: state.service.gate.expected(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub streams: usize,
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

pub async fn stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.service.stats())
}

/// Publish a JSON message to a broker topic
pub async fn publish_message(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    send(&state.service.messages, topic, body).await
}

/// Append a JSON event to an event log stream
pub async fn publish_event(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    send(&state.service.events, stream, body).await
}

async fn send(
    queue: &Arc<OutboundQueue>,
    destination: String,
    body: Value,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    if destination.trim().is_empty() {
        return Err(AppError::Validation("destination must not be empty".to_string()));
    }

    let mut metadata = Metadata::new();
    metadata.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

    let item = OutboundItem::json(destination, &body)?.with_metadata(metadata);
    let id = item.id;

    let outcome = queue.send(item).await;
    let status = match outcome {
        SendOutcome::Delivered => StatusCode::OK,
        SendOutcome::Queued => StatusCode::ACCEPTED,
        SendOutcome::Dropped => {
            return Err(AppError::Delivery(format!("item {} was rejected by {}", id, queue.name())))
        }
        SendOutcome::Rejected => return Err(AppError::NotReady("service is shutting down".to_string())),
    };

    Ok((status, Json(PublishResponse { id, outcome })))
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub id: Uuid,
    pub outcome: SendOutcome,
}
