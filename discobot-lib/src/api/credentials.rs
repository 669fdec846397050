//! Project credentials. Secret material is sealed before it reaches the
//! store and never appears in a response (the model skips the field during
//! serialization).

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState, require_member};
use crate::crypto;
use crate::error::Error;
use crate::model::{AuthType, Credential};

#[derive(Debug, Deserialize)]
pub struct CreateCredentialRequest {
    pub provider: String,
    #[serde(rename = "authType")]
    pub auth_type: String,
    pub secret: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/projects/{pid}/credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/projects/{pid}/credentials/{cid}",
            axum::routing::delete(delete_credential),
        )
}

async fn list_credentials(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<Vec<Credential>>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(state.store.list_credentials(&project.id).await?))
}

async fn create_credential(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Json(body): Json<CreateCredentialRequest>,
) -> ApiResult<Json<Credential>> {
    let project = require_member(&state, &pid, &user).await?;
    let auth_type = AuthType::parse(&body.auth_type)
        .ok_or_else(|| Error::InvalidRequest("authType must be 'api_key' or 'oauth'".into()))?;
    if body.secret.is_empty() {
        return Err(Error::InvalidRequest("secret must not be empty".into()).into());
    }
    let sealed = crypto::encrypt_secret(&body.secret, &state.config.shared_secret_salt)?;
    let credential = state
        .store
        .create_credential(&project.id, &body.provider, auth_type, &sealed)
        .await?;
    Ok(Json(credential))
}

async fn delete_credential(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, cid)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let credentials = state.store.list_credentials(&project.id).await?;
    if !credentials.iter().any(|c| c.id == cid) {
        return Err(Error::NotFound(format!("credential '{cid}'")).into());
    }
    state.store.delete_credential(&cid).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
