use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState, require_member};
use crate::error::Error;
use crate::model::{JobType, NewJob, Workspace, WorkspaceSource};

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub path: String,
    #[serde(rename = "sourceType")]
    pub source_type: String,
    #[serde(rename = "sourceUrl")]
    pub source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteWorkspaceParams {
    /// Also remove the working tree from disk.
    #[serde(rename = "deleteFiles", default)]
    pub delete_files: bool,
    /// Opt into deleting the workspace's sessions along with it.
    #[serde(default)]
    pub cascade: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/projects/{pid}/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/projects/{pid}/workspaces/{wid}",
            get(get_workspace).delete(delete_workspace),
        )
}

async fn list_workspaces(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(state.store.list_workspaces(&project.id).await?))
}

async fn create_workspace(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Json(body): Json<CreateWorkspaceRequest>,
) -> ApiResult<Json<Workspace>> {
    let project = require_member(&state, &pid, &user).await?;
    let source_type = WorkspaceSource::parse(&body.source_type)
        .ok_or_else(|| Error::InvalidRequest("sourceType must be 'local' or 'git'".into()))?;
    if source_type == WorkspaceSource::Git && body.source_url.is_none() {
        return Err(Error::InvalidRequest("git workspaces need a sourceUrl".into()).into());
    }
    if body.path.trim().is_empty() {
        return Err(Error::InvalidRequest("path must not be empty".into()).into());
    }

    let workspace = state
        .store
        .create_workspace(
            &project.id,
            &body.name,
            &body.path,
            source_type,
            body.source_url.as_deref(),
        )
        .await?;
    state
        .store
        .enqueue_job(
            NewJob::new(
                JobType::WorkspaceInit,
                json!({
                    "workspaceId": workspace.id,
                    "projectId": project.id,
                }),
            )
            .resource("workspace", &workspace.id),
        )
        .await?;
    state.sessions.emit_workspace(&workspace).await;
    Ok(Json(workspace))
}

async fn get_workspace(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, wid)): Path<(String, String)>,
) -> ApiResult<Json<Workspace>> {
    let project = require_member(&state, &pid, &user).await?;
    let workspace = state.store.get_workspace(&wid).await?;
    if workspace.project_id != project.id {
        return Err(Error::NotFound(format!("workspace '{wid}'")).into());
    }
    Ok(Json(workspace))
}

async fn delete_workspace(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, wid)): Path<(String, String)>,
    Query(params): Query<DeleteWorkspaceParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let workspace = state.store.get_workspace(&wid).await?;
    if workspace.project_id != project.id {
        return Err(Error::NotFound(format!("workspace '{wid}'")).into());
    }

    let open_sessions = state
        .store
        .count_open_sessions_for_workspace(&workspace.id)
        .await?;
    if open_sessions > 0 && !params.cascade {
        return Err(Error::conflict_with(
            "workspace_has_sessions",
            json!({ "openSessions": open_sessions }),
        )
        .into());
    }

    // Schedule sandbox teardown for every session the cascade removes.
    for session in state
        .store
        .list_sessions(&project.id, Some(&workspace.id), true)
        .await?
    {
        let _ = state
            .store
            .enqueue_job(
                NewJob::new(
                    JobType::ContainerDestroy,
                    json!({
                        "sessionId": session.id,
                        "projectId": project.id,
                    }),
                )
                .resource("sandbox", &session.id),
            )
            .await;
    }
    state.store.delete_workspace(&workspace.id).await?;

    if params.delete_files && workspace.source_type == WorkspaceSource::Git {
        // Only clones this service made are eligible for disk removal.
        if let Err(err) = tokio::fs::remove_dir_all(&workspace.path).await {
            tracing::warn!(path = %workspace.path, error = %err, "failed to delete workspace files");
        }
    }
    Ok(Json(json!({ "deleted": true })))
}
