//! HTTP surface for the Tablekeeper service.
//!
//! - `GET /ws` upgrades to the frame protocol
//! - `GET /health` reports liveness and load
//! - `GET /metrics` renders Prometheus text

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::service::{HealthReport, TablekeeperService};
use crate::websocket::handle_ws_connection;

/// Upper bound for plain HTTP requests; upgraded sockets are not affected
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state
pub struct AppState {
    pub service: Arc<TablekeeperService>,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router
pub fn router(service: Arc<TablekeeperService>, metrics: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(AppState { service, metrics });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(TimeoutLayer::new(HTTP_TIMEOUT)),
        )
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.service.health())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::from("metrics recorder not installed\n"),
        ),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("WebSocket upgrade request received");
    let service = state.service.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, service))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::service::tests::test_service;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (service, _gateway) = test_service();
        let app = router(service, None);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (service, _gateway) = test_service();
        let app = router(service, None);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
