//! HTTP daemon surface: health check, status and Prometheus metrics.
//!
//! Handlers read the snapshot store and the loader status only; neither
//! path can block the aggregator.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use log::info;
use serde_json::json;
use tokio::net::TcpListener;

use crate::loader::Monitor;
use crate::prometheus;
use crate::VERSION;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until the listener fails; callers drop the task on shutdown.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// 200 while the loader is running, 503 otherwise.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.monitor.is_running();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    (code, Json(body))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let monitor_status = state.monitor.status().await;
    let snapshot = state.monitor.store().current();

    let (containers, memory, maps, last_update) = match &snapshot {
        Some(s) => (
            s.containers.len(),
            s.system_memory_bytes,
            s.kernel_maps,
            s.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        None => (
            0,
            0,
            monitor_status.map_count,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    };

    Json(json!({
        "version": VERSION,
        "state": monitor_status.state.to_string(),
        "uptime_seconds": state.monitor.uptime().as_secs(),
        "containers_monitored": containers,
        "memory_usage_bytes": memory,
        "ebpf_maps_count": maps,
        "events_handled": monitor_status.events_handled,
        "events_dropped": monitor_status.dropped_events,
        "decode_errors": monitor_status.decode_errors,
        "last_update": last_update,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.monitor.store().current();
    let supervisor = state.monitor.supervisor();

    // Reuse a pooled buffer for the exposition document; scrapes come every
    // few seconds and the document size is stable.
    let mut buffer = supervisor.pools.get_buffer();
    prometheus::render_into(&mut buffer, snapshot.as_deref(), state.monitor.uptime());
    let body = buffer.clone();
    buffer.clear();
    supervisor.pools.byte_buffers.put(buffer);

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn health_reports_unhealthy_before_start() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        let state = AppState { monitor };
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_emits_up_zero_without_snapshot() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        let state = AppState { monitor };
        let response = metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("microradar_up 0"));
    }

    #[tokio::test]
    async fn status_includes_version_and_state() {
        let monitor = Monitor::new(Config::default(), Vec::new());
        let state = AppState { monitor };
        let response = status(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["version"], VERSION);
        assert_eq!(parsed["state"], "unloaded");
        assert_eq!(parsed["containers_monitored"], 0);
    }
}
