//! System status: liveness plus the dispatcher tasks currently in flight
//! for this project.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState, require_member};

pub fn router() -> Router<AppState> {
    Router::new().route("/projects/{pid}/system/status", get(system_status))
}

async fn system_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;

    let startup_tasks: Vec<serde_json::Value> = state
        .store
        .list_active_jobs()
        .await?
        .into_iter()
        .filter(|job| {
            job.payload
                .get("projectId")
                .and_then(|v| v.as_str())
                .map(|p| p == project.id)
                .unwrap_or(false)
        })
        .map(|job| {
            json!({
                "id": job.id,
                "type": job.job_type,
                "status": job.status,
                "attempts": job.attempts,
                "error": job.error,
                "createdAt": job.created_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "ok": true,
        "messages": [],
        "startupTasks": startup_tasks,
    })))
}
