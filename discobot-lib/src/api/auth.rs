//! Cookie-based authentication.
//!
//! The session token rides in the `discobot_session` cookie and is checked
//! against its salted hash in `user_sessions`. With `AUTH_ENABLED=false`
//! every request resolves to the reserved anonymous user.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::{ApiError, AppState};
use crate::crypto;
use crate::error::Error;
use crate::model::User;
use crate::{ANONYMOUS_USER_ID, SESSION_COOKIE};

/// Authenticated principal, injected into handlers.
#[derive(Clone, Debug)]
pub struct AuthUser(pub User);

fn cookie_value(parts: &Parts, name: &str) -> Option<String> {
    let header = parts.headers.get(axum::http::header::COOKIE)?;
    let raw = header.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=')
            && key == name
        {
            return Some(value.to_string());
        }
    }
    None
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if !state.config.auth_enabled {
            let user = anonymous_user(state).await?;
            return Ok(AuthUser(user));
        }

        let token = cookie_value(parts, SESSION_COOKIE)
            .ok_or_else(|| Error::Unauthorized("missing session cookie".into()))?;
        let hash = crypto::hash_token(&token, &state.config.shared_secret_salt);
        let session = state
            .store
            .get_user_session_by_hash(&hash)
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid or expired session".into()))?;
        let user = state.store.get_user(&session.user_id).await?;
        Ok(AuthUser(user))
    }
}

/// The reserved no-auth principal. Created on first use (the binary also
/// seeds it at startup together with the default project).
pub async fn anonymous_user(state: &AppState) -> Result<User, ApiError> {
    if let Some(user) = state
        .store
        .get_user_by_provider("anonymous", ANONYMOUS_USER_ID)
        .await?
    {
        return Ok(user);
    }
    Ok(state
        .store
        .ensure_user("anonymous", ANONYMOUS_USER_ID, "Anonymous")
        .await?)
}
