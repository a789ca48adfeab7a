//! HTTP status API: exposes collector state as JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use profiler_net::CountingObserver;

use crate::registry::{PodEntry, PodRegistry, RegistryStats};

#[derive(Clone)]
pub struct ApiState {
    pub registry: PodRegistry,
    pub observer: Arc<CountingObserver>,
    pub started: Instant,
    /// Shutdown broadcast sender: signals graceful collector shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handle_status))
        .route("/pods", get(handle_pods))
        .route("/pods/{name}", get(handle_pod))
        .route("/collector/shutdown", post(handle_shutdown))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub pods: RegistryStats,
    pub io: IoInfo,
}

#[derive(Debug, Serialize)]
pub struct IoInfo {
    pub commands: u64,
    pub command_errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let o = &state.observer;
    Json(StatusResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        pods: state.registry.stats(),
        io: IoInfo {
            commands: o.total_commands(),
            command_errors: o.command_errors(),
            bytes_read: o.bytes_read(),
            bytes_written: o.bytes_written(),
            errors: o.errors(),
        },
    })
}

// ── /pods ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PodInfo {
    pub name: String,
    #[serde(flatten)]
    pub entry: PodEntry,
}

pub async fn handle_pods(State(state): State<ApiState>) -> Json<Vec<PodInfo>> {
    let pods = state
        .registry
        .list()
        .into_iter()
        .map(|(name, entry)| PodInfo { name, entry })
        .collect();
    Json(pods)
}

pub async fn handle_pod(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<PodInfo>, (StatusCode, String)> {
    let entry = state
        .registry
        .get(&name)
        .ok_or((StatusCode::NOT_FOUND, "pod not found".to_string()))?;
    Ok(Json(PodInfo { name, entry }))
}

// ── /collector/shutdown ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "collector shutting down".to_string(),
    })
}
