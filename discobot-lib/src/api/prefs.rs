//! Per-user preferences (upsert semantics).

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState};
use crate::error::Error;

#[derive(Debug, Deserialize)]
pub struct SetPreferenceRequest {
    pub value: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user/preferences", get(list_preferences))
        .route(
            "/user/preferences/{key}",
            get(get_preference).put(set_preference),
        )
}

async fn list_preferences(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let prefs = state.store.list_user_preferences(&user.id).await?;
    let map: serde_json::Map<String, serde_json::Value> = prefs
        .into_iter()
        .map(|(key, value)| (key, serde_json::Value::String(value)))
        .collect();
    Ok(Json(serde_json::Value::Object(map)))
}

async fn get_preference(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = state
        .store
        .get_user_preference(&user.id, &key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("preference '{key}'")))?;
    Ok(Json(json!({ "key": key, "value": value })))
}

async fn set_preference(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(key): Path<String>,
    Json(body): Json<SetPreferenceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .store
        .set_user_preference(&user.id, &key, &body.value)
        .await?;
    Ok(Json(json!({ "key": key, "value": body.value })))
}
