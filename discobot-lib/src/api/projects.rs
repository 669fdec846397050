use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState, require_member};
use crate::error::Error;
use crate::model::{MemberRole, Project};

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub slug: String,
    pub name: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{pid}",
            get(get_project).delete(delete_project),
        )
}

async fn list_projects(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.store.list_projects_for_user(&user.id).await?))
}

async fn create_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<Json<Project>> {
    let slug = body.slug.trim();
    if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::InvalidRequest("invalid project slug".into()).into());
    }
    if state.store.get_project_by_slug(slug).await?.is_some() {
        return Err(Error::conflict("slug_taken").into());
    }
    let name = body.name.as_deref().unwrap_or(slug);
    let project = state.store.create_project(slug, name, &user.id).await?;
    Ok(Json(project))
}

async fn get_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let member = state
        .store
        .get_project_member(&project.id, &user.id)
        .await?;
    if !matches!(member.map(|m| m.role), Some(MemberRole::Owner)) {
        return Err(Error::Forbidden("only owners may delete a project".into()).into());
    }
    // Tear down every session's sandbox before the rows disappear.
    for session in state.store.list_sessions(&project.id, None, true).await? {
        let _ = state.sessions.delete_session(&session).await;
    }
    state.store.delete_project(&project.id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
