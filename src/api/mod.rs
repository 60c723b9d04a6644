//! API — Axum server for the round trigger and read-only arena state.
//!
//! CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::{ApiState, AppState};

/// Bind the port and serve in a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server stopped");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/rounds/run", post(routes::run_rounds))
        .route("/api/reset", post(routes::reset))
        .route("/api/agents/resume", post(routes::resume_agents))
        .route("/api/state", get(routes::get_state))
        .route("/api/agents", get(routes::list_agents))
        .route("/api/agents/:id", get(routes::get_agent))
        .route("/api/season", get(routes::get_season))
        .route("/api/seasons/:number/leaderboard", get(routes::get_leaderboard))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
