//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::provisioning::{self, CreatedSandbox};
use crate::registry::{unix_millis, SessionStatus};
use crate::state::AppState;
use crate::status::{self, SandboxStatus};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::SystemTime;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// Request/Response types
#[derive(Deserialize)]
struct CreateRequest {
    owner: String,
    repo: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    sandbox_id: String,
}

#[derive(Serialize)]
struct StopResponse {
    success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    #[serde(default)]
    sandbox_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    id: String,
    terminal_url: String,
    status: SessionStatus,
    created_at: u64,
    remaining_ms: u64,
}

/// Build the API router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sandbox.create", post(create_sandbox))
        .route("/api/sandbox.stop", post(stop_sandbox))
        .route("/api/sandbox.getStatus", get(get_status))
        .route("/api/sandbox.list", get(list_sandboxes))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreatedSandbox>> {
    // Detached so a client hanging up mid-workflow cannot strand an environment.
    let created = tokio::spawn(async move {
        provisioning::create_sandbox(&state, &req.owner, &req.repo).await
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))??;

    Ok(Json(created))
}

async fn stop_sandbox(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> Result<Json<StopResponse>> {
    // Detached so a hang-up cannot leave the id claimed by an abandoned stop.
    tokio::spawn(async move { provisioning::stop_sandbox(&state, &req.sandbox_id).await })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    Ok(Json(StopResponse { success: true }))
}

async fn get_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Json<SandboxStatus> {
    Json(status::get_status(&state, &query.sandbox_id).await)
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let now = SystemTime::now();
    let list = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|s| SessionInfo {
            status: s.status_at(now),
            created_at: unix_millis(s.created_at),
            remaining_ms: s.remaining_at(now).as_millis() as u64,
            id: s.id,
            terminal_url: s.terminal_url,
        })
        .collect();
    Json(list)
}
