//! JSON/SSE HTTP API.
//!
//! Router-per-module, merged here. Every project-scoped route goes through
//! the `AuthUser` extractor plus a membership check; errors render as the
//! `{"error": "<snake_code>"}` envelope with the §7 status mapping.

pub mod agents;
pub mod auth;
pub mod chat;
pub mod credentials;
pub mod events;
pub mod prefs;
pub mod projects;
pub mod services;
pub mod sessions;
pub mod system;
pub mod workspaces;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sandbox_runtime::Provider;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::completion::CompletionService;
use crate::config::Config;
use crate::error::Error;
use crate::events::EventBroker;
use crate::model::{Project, User};
use crate::session::SessionService;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub broker: Arc<EventBroker>,
    pub provider: Arc<dyn Provider>,
    pub sessions: Arc<SessionService>,
    pub completions: Arc<CompletionService>,
    pub config: Arc<Config>,
}

/// HTTP rendering of the error taxonomy.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<sandbox_runtime::ProviderError> for ApiError {
    fn from(err: sandbox_runtime::ProviderError) -> Self {
        ApiError(Error::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::BackendUnavailable(_) | Error::StartTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Storage(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        let mut body = serde_json::json!({ "error": self.0.code() });
        if let Error::Conflict {
            details: Some(details),
            ..
        } = &self.0
            && let (Some(body_map), Some(extra)) = (body.as_object_mut(), details.as_object())
        {
            for (key, value) in extra {
                body_map.insert(key.clone(), value.clone());
            }
        }
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Project lookup + membership authorization in one step.
pub async fn require_member(
    state: &AppState,
    project_id: &str,
    user: &User,
) -> ApiResult<Project> {
    let project = state.store.get_project(project_id).await?;
    let member = state
        .store
        .get_project_member(&project.id, &user.id)
        .await?;
    if member.is_none() {
        return Err(Error::Forbidden("not a project member".into()).into());
    }
    Ok(project)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(projects::router())
        .merge(workspaces::router())
        .merge(sessions::router())
        .merge(chat::router())
        .merge(agents::router())
        .merge(credentials::router())
        .merge(services::router())
        .merge(events::router())
        .merge(system::router())
        .merge(prefs::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
