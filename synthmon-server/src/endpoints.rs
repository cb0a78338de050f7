//! Contains all HTTP endpoint handlers.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing;
use axum::Router;

use crate::state::ServiceState;

pub fn routes(metrics_path: &str) -> Router<ServiceState> {
    Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(health))
        .route(metrics_path, routing::get(metrics))
}

async fn index(State(state): State<ServiceState>) -> String {
    format!(
        "Synthetic Storage Monitor\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Health check\n",
        state.config.metrics.path
    )
}

async fn health() -> impl IntoResponse {
    "OK\n"
}

async fn metrics(State(state): State<ServiceState>) -> Response {
    match state.collector.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("failed to render metrics: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
