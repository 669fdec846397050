use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::{ApiError, ApiResult, AppState, require_member};
use crate::error::Error;
use crate::model::{Message, Session, TerminalRecord};

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    #[serde(rename = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(rename = "includeClosed", default)]
    pub include_closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/projects/{pid}/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/projects/{pid}/sessions/{sid}",
            get(get_session).delete(delete_session),
        )
        .route("/projects/{pid}/sessions/{sid}/commit", post(commit_session))
        .route("/projects/{pid}/sessions/{sid}/messages", get(list_messages))
        .route(
            "/projects/{pid}/sessions/{sid}/terminal",
            get(terminal_history),
        )
}

/// Session scoped to this project, or 404.
pub async fn project_session(
    state: &AppState,
    project_id: &str,
    session_id: &str,
) -> Result<Session, ApiError> {
    let session = state.store.get_session(session_id).await?;
    if session.project_id != project_id {
        return Err(Error::NotFound(format!("session '{session_id}'")).into());
    }
    Ok(session)
}

async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Query(params): Query<ListSessionsParams>,
) -> ApiResult<Json<Vec<Session>>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(
        state
            .store
            .list_sessions(
                &project.id,
                params.workspace_id.as_deref(),
                params.include_closed,
            )
            .await?,
    ))
}

async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<Json<Session>> {
    let project = require_member(&state, &pid, &user).await?;
    let name = body.name.as_deref().unwrap_or("untitled");
    let session = state
        .sessions
        .create_session(
            &project.id,
            &body.workspace_id,
            body.agent_id.as_deref(),
            name,
            body.description.as_deref(),
        )
        .await?;
    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(project_session(&state, &project.id, &sid).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let session = project_session(&state, &project.id, &sid).await?;
    state.sessions.delete_session(&session).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Opt-in archive: drives the session to `closed` via a commit job.
async fn commit_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    let project = require_member(&state, &pid, &user).await?;
    let session = project_session(&state, &project.id, &sid).await?;
    state.sessions.request_commit(&session).await?;
    Ok(Json(project_session(&state, &project.id, &sid).await?))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Message>>> {
    let project = require_member(&state, &pid, &user).await?;
    let session = project_session(&state, &project.id, &sid).await?;
    Ok(Json(state.store.list_messages(&session.id).await?))
}

async fn terminal_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<Vec<TerminalRecord>>> {
    let project = require_member(&state, &pid, &user).await?;
    let session = project_session(&state, &project.id, &sid).await?;
    Ok(Json(state.store.list_terminal_history(&session.id).await?))
}
