//! HTTP server exposing readiness, metrics and registered management
//! endpoints.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use flowmux_core::endpoints::EndpointRegistry;
use flowmux_core::metrics::SharedMetrics;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub endpoints: Arc<EndpointRegistry>,
    pub metrics: SharedMetrics,
}

/// Start the HTTP server. Engine-registered endpoints (readiness, dynamic
/// input management) are dispatched through the endpoint registry; metrics
/// are served in Prometheus text format.
pub async fn start_server(
    state: Arc<ServerState>,
    address: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/endpoints", get(endpoints_handler))
        .fallback(dispatch_handler)
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, address = %address, "Failed to bind HTTP server");
            return;
        }
    };

    info!(address = %address, "HTTP server started");

    tokio::select! {
        res = axum::serve(listener, router) => {
            if let Err(err) = res {
                error!(error = %err, "HTTP server error");
            }
        }
        _ = shutdown_rx.recv() => {
            info!("HTTP server shutting down");
        }
    }
}

/// Dispatch unmatched paths through the endpoint registry.
async fn dispatch_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> impl IntoResponse {
    match state
        .endpoints
        .dispatch(method.as_str(), uri.path(), body.to_vec())
    {
        Some(res) => (
            StatusCode::from_u16(res.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            res.body,
        ),
        None => (StatusCode::NOT_FOUND, b"not found".to_vec()),
    }
}

/// List registered endpoints and their descriptions.
async fn endpoints_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let listing: std::collections::BTreeMap<String, String> =
        state.endpoints.list().into_iter().collect();
    match serde_json::to_vec(&listing) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string().into_bytes()),
    }
}

/// Prometheus text exposition of the metrics registry.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let mut output = String::with_capacity(2048);

    for (name, value) in &snapshot.counters {
        output.push_str(&format!(
            "# TYPE flowmux_{name} counter\nflowmux_{name} {value}\n"
        ));
    }
    for (name, sum_ns, count) in &snapshot.timers {
        output.push_str(&format!(
            "# TYPE flowmux_{name} summary\nflowmux_{name}_sum {sum_ns}\nflowmux_{name}_count {count}\n"
        ));
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}
