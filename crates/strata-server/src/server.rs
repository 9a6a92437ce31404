use axum::{
    Json, Router,
    extract::{Query, State, ws::WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::bootstrap::{AppState, Strata};
use crate::error::ServerResult;
use crate::metrics;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Stable client identity for reconnect backoff hints.
    pub client: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    let client_key = params
        .client
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
    strata_gateway::upgrade(ws, state.gateway.clone(), client_key)
}

/// Tier reachability, feed states and gateway counters. Responds 503 when a
/// tier is unreachable or a feed has failed.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let tiers = state.cache.health().await;
    let feeds = state.feeds.all();
    let healthy = tiers.iter().all(|t| t.healthy) && state.feeds.is_healthy();

    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = json!({
        "status": label,
        "tiers": tiers,
        "feeds": feeds,
        "cache": state.cache.stats(),
        "gateway": state.gateway.stats(),
    });
    (status, Json(body))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    metrics::record_gateway_stats(&state.gateway.stats());
    metrics::record_local_entries(state.cache.stats().local_entries);

    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// Serve until Ctrl+C, then shut every component down in order.
pub async fn run(strata: Strata, addr: SocketAddr) -> ServerResult<()> {
    let state = strata.state();
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets outlive the HTTP drain; close them here so
            // clients get their farewell frame.
            state.gateway.shutdown();
        })
        .await?;

    strata.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
