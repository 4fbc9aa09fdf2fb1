//! HTTP surface for the orchestrator.
//!
//! The chat endpoint accepts a query, returns the opened turn's message id
//! immediately, and lets the client poll the message log for thought steps
//! and the finalized artifact.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::intent::classifier;
use crate::orchestrator::Orchestrator;
use crate::store::DbHandle;
use crate::store::models::MessageRole;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Orchestrator,
    pub poll_interval: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub query: String,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    /// Return only messages with an id greater than this.
    #[serde(default)]
    pub after: i64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/sessions/{session_id}/messages", get(session_messages))
        .route("/api/sessions/{session_id}/latest", get(session_latest))
        .route("/api/messages/{id}", get(get_message))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{id}", get(get_project))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Accept a chat query: log the user turn, classify, dispatch. Responds as
/// soon as the ai turn exists; the result arrives through polling.
async fn chat(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if req.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    if req.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session_id must not be empty".into()));
    }

    let history = {
        let session = req.session_id.clone();
        let messages = state
            .db
            .call(move |db| db.messages_since(&session, 0))
            .await?;
        messages
            .into_iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content)
            .collect::<Vec<_>>()
    };

    let session = req.session_id.clone();
    let query = req.query.clone();
    state
        .db
        .call(move |db| db.append_message(&session, MessageRole::User, &query, true))
        .await?;

    let intent = classifier::classify(&req.query, &history);
    info!(session_id = %req.session_id, kind = ?intent.kind, "chat query accepted");

    let message_id = state
        .orchestrator
        .handle(intent, &req.session_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message_id": message_id,
            "session_id": req.session_id,
            "poll_interval_secs": state.poll_interval.as_secs(),
        })),
    )
        .into_response())
}

async fn session_messages(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Response, ApiError> {
    let messages = state
        .db
        .call(move |db| db.messages_since(&session_id, query.after))
        .await?;
    Ok(Json(messages).into_response())
}

/// The poll target: newest ai turn for the session, open or complete.
async fn session_latest(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let latest = state
        .db
        .call(move |db| db.latest_ai_message(&session_id))
        .await?;
    match latest {
        Some(message) => Ok(Json(message).into_response()),
        None => Err(ApiError::NotFound("no ai messages in session".into())),
    }
}

async fn get_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let message = state.db.call(move |db| db.get_message(id)).await?;
    match message {
        Some(message) => Ok(Json(message).into_response()),
        None => Err(ApiError::NotFound(format!("message {} not found", id))),
    }
}

async fn list_projects(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects).into_response())
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let lookup = id.clone();
    let project = state.db.call(move |db| db.get_project(&lookup)).await?;
    match project {
        Some(project) => Ok(Json(project).into_response()),
        None => Err(ApiError::NotFound(format!("project {} not found", id))),
    }
}
