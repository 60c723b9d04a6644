//! Round-trigger API handlers.
//!
//! All endpoints return JSON. Lock contention answers 409 with the current
//! holder; domain validation errors answer 400.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::chain::ChainRecord;
use crate::engine::arena::{ArenaService, LockOutcome, ResumeOutcome, RunOutcome, RunRequest};
use crate::policy::PolicyVersion;
use crate::types::{Agent, ArenaError, LeaderboardEntry, Partnership, Season, SimulationState};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub arena: Arc<ArenaService>,
    /// Lock identity used for API-triggered rounds.
    pub holder: String,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps domain errors onto HTTP status codes.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ArenaError>() {
            Some(ArenaError::AgentNotFound(_) | ArenaError::TaskNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Some(ArenaError::PolicyVersionConflict { .. } | ArenaError::LockLost { .. }) => {
                StatusCode::CONFLICT
            }
            Some(ArenaError::Storage(_) | ArenaError::Decision { .. }) | None => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Some(_) => StatusCode::BAD_REQUEST,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %format!("{:#}", self.0), "Request failed");
        }
        (status, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub win_rate: f64,
    /// Last registry value, if the registry cache is enabled.
    pub chain: Option<ChainRecord>,
}

#[derive(Debug, Serialize)]
pub struct AgentDetail {
    pub agent: Agent,
    pub policy: Option<PolicyVersion>,
    pub partnerships: Vec<Partnership>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub season: Season,
    pub entries: Vec<LeaderboardEntry>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/rounds/run
pub async fn run_rounds(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> ApiResult<Response> {
    let outcome = state.arena.run_rounds(&state.holder, &request).await?;
    let status = match &outcome {
        RunOutcome::Completed { rounds } => {
            info!(rounds = rounds.len(), "Rounds run via API");
            StatusCode::OK
        }
        RunOutcome::Busy { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

/// POST /api/reset
pub async fn reset(State(state): State<AppState>) -> ApiResult<Response> {
    let outcome = state.arena.reset(&state.holder).await?;
    let status = match outcome {
        LockOutcome::Acquired { .. } => StatusCode::OK,
        LockOutcome::Busy { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

/// POST /api/agents/resume
pub async fn resume_agents(State(state): State<AppState>) -> ApiResult<Response> {
    let outcome = state.arena.resume_agents(&state.holder).await?;
    let status = match outcome {
        ResumeOutcome::Resumed { .. } => StatusCode::OK,
        ResumeOutcome::Busy { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

/// GET /api/state
pub async fn get_state(State(state): State<AppState>) -> ApiResult<Json<SimulationState>> {
    Ok(Json(state.arena.store().load_state().await?))
}

/// GET /api/agents
pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<AgentView>>> {
    let agents = state.arena.store().list_agents().await?;
    let mut views = Vec::with_capacity(agents.len());
    for agent in agents {
        let chain = match state.arena.chain() {
            Some(cache) => cache.cached(&agent.id).await,
            None => None,
        };
        views.push(AgentView {
            win_rate: agent.win_rate(),
            agent,
            chain,
        });
    }
    Ok(Json(views))
}

/// GET /api/agents/:id
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentDetail>> {
    let store = state.arena.store();
    let agent = store
        .get_agent(&id)
        .await?
        .ok_or_else(|| anyhow::Error::from(ArenaError::AgentNotFound(id.clone())))?;
    Ok(Json(AgentDetail {
        policy: store.latest_policy(&id).await?,
        partnerships: store.partnerships_for_agent(&id).await?,
        agent,
    }))
}

/// GET /api/season
pub async fn get_season(State(state): State<AppState>) -> ApiResult<Json<Option<Season>>> {
    Ok(Json(state.arena.active_season().await?))
}

/// GET /api/seasons/:number/leaderboard
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Response> {
    let store = state.arena.store();
    let Some(season) = store.season_by_number(number).await? else {
        let body = Json(json!({ "error": format!("season {number} not found") }));
        return Ok((StatusCode::NOT_FOUND, body).into_response());
    };
    let entries = store.leaderboard(&season.id).await?;
    Ok(Json(LeaderboardResponse { season, entries }).into_response())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
