//! HTTP request metrics

use super::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Axum middleware recording request count and duration per route.
///
/// ```no_run
/// use axum::{middleware, Router};
/// use kitsvc_delivery::metrics::track_metrics;
///
/// let app: Router = Router::new().layer(middleware::from_fn(track_metrics));
/// ```
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    // Scrapes would dominate the series
    if path == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(start.elapsed().as_secs_f64());

    response
}
