use crate::api::{handlers, AppState};
use crate::metrics::track_metrics;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// Build the main API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness))
        // Observability
        .route("/metrics", get(handlers::metrics_handler))
        .route("/stats", get(handlers::stats))
        // Outbound delivery
        .route("/v1/messages/:topic", post(handlers::publish_message))
        .route("/v1/events/:stream", post(handlers::publish_event))
        .with_state(state)
        .layer(middleware::from_fn(track_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
}
