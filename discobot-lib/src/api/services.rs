//! In-sandbox service operations. The service model (front-matter parsed
//! definitions, ports, passive flags) lives inside the sandbox; this
//! surface forwards each operation unchanged and mirrors the agent-api's
//! responses, including its conflict codes.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use futures::StreamExt;
use sandbox_runtime::{ProxyRequest, ProxyResponse};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::sessions::project_session;
use crate::api::{ApiError, ApiResult, AppState, require_member};
use crate::error::Error;
use crate::model::SessionStatus;

#[derive(Debug, Deserialize)]
pub struct ServiceParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{pid}/services", get(list_services))
        .route("/projects/{pid}/services/{service_id}/start", post(start_service))
        .route("/projects/{pid}/services/{service_id}/stop", post(stop_service))
        .route("/projects/{pid}/services/{service_id}/output", get(service_output))
        .route(
            "/projects/{pid}/services/{service_id}/http/{*rest}",
            any(service_http),
        )
}

async fn running_session(
    state: &AppState,
    project_id: &str,
    session_id: &str,
) -> Result<String, ApiError> {
    let session = project_session(state, project_id, session_id).await?;
    if session.status != SessionStatus::Running {
        return Err(Error::conflict("session_not_running").into());
    }
    Ok(session.id)
}

/// Mirror a proxied response verbatim: status, content type, streamed body.
fn mirror(response: ProxyResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &response.headers {
        let lowered = name.to_ascii_lowercase();
        if lowered == "content-type" || lowered == "cache-control" {
            builder = builder.header(name, value);
        }
    }
    let body = response
        .body
        .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));
    builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn list_services(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Query(params): Query<ServiceParams>,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;
    let session_id = running_session(&state, &project.id, &params.session_id).await?;
    let response = state
        .provider
        .http_proxy(&session_id, ProxyRequest::get("/services"))
        .await?;
    Ok(mirror(response))
}

async fn start_service(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, service_id)): Path<(String, String)>,
    Query(params): Query<ServiceParams>,
) -> ApiResult<Response> {
    forward_post(state, user, pid, params.session_id, service_id, "start").await
}

async fn stop_service(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, service_id)): Path<(String, String)>,
    Query(params): Query<ServiceParams>,
) -> ApiResult<Response> {
    forward_post(state, user, pid, params.session_id, service_id, "stop").await
}

async fn forward_post(
    state: AppState,
    user: crate::model::User,
    pid: String,
    session_id: String,
    service_id: String,
    op: &str,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;
    let session_id = running_session(&state, &project.id, &session_id).await?;
    let request = ProxyRequest::post_json(
        format!("/services/{service_id}/{op}"),
        &serde_json::json!({}),
    );
    let response = state.provider.http_proxy(&session_id, request).await?;
    Ok(mirror(response))
}

/// SSE passthrough of the service's captured output.
async fn service_output(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, service_id)): Path<(String, String)>,
    Query(params): Query<ServiceParams>,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;
    let session_id = running_session(&state, &project.id, &params.session_id).await?;
    let request = ProxyRequest::get(format!("/services/{service_id}/output"))
        .header("accept", "text/event-stream");
    let response = state.provider.http_proxy(&session_id, request).await?;
    Ok(mirror(response))
}

/// Arbitrary HTTP into the service, path and body forwarded unchanged.
async fn service_http(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, service_id, rest)): Path<(String, String, String)>,
    Query(params): Query<ServiceParams>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;
    let session_id = running_session(&state, &project.id, &params.session_id).await?;

    let method = request.method().as_str().to_string();
    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .filter(|(name, _)| name != "host" && name != "content-length")
        .collect();
    let body = request
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));

    let proxy_request = ProxyRequest {
        method,
        path: format!("/services/{service_id}/http/{rest}"),
        headers,
        body: Some(Box::pin(body)),
    };
    let response = state.provider.http_proxy(&session_id, proxy_request).await?;
    Ok(mirror(response))
}
