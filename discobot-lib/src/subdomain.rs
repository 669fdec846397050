//! Subdomain reverse proxy: `{sessionId}-svc-{serviceId}.{base}` hosts
//! route into the session's sandbox.
//!
//! Credentials never cross the boundary: `Authorization`, `Cookie`, and
//! `X-Discobot-Credentials` are stripped after the membership check, and
//! redirects are passed through untouched. Anything that fails resolution
//! or authorization is a plain 404 so the hostname space leaks nothing.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use sandbox_runtime::ProxyRequest;

use crate::CREDENTIALS_HEADER;
use crate::api::AppState;
use crate::api::auth::anonymous_user;
use crate::crypto;
use crate::model::{SessionStatus, User};
use crate::SESSION_COOKIE;

// Lazy service capture: the service ID ends at the first dot, the rest is
// the serving base domain.
static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Za-z]{26})-svc-([a-zA-Z0-9_-]+?)\.").expect("static pattern")
});

/// Parse a service host header into `(session_id, service_id)`.
pub fn parse_service_host(host: &str) -> Option<(String, String)> {
    let captures = HOST_PATTERN.captures(host)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

/// Middleware in front of the API router: service hosts are proxied, every
/// other host falls through to the API.
pub async fn middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    match parse_service_host(&host) {
        Some((session_id, service_id)) => {
            proxy(state, request, host, session_id, service_id).await
        }
        None => next.run(request).await,
    }
}

async fn proxy(
    state: AppState,
    request: Request,
    host: String,
    session_id: String,
    service_id: String,
) -> Response {
    // Resolve and authorize before anything is forwarded. All failures are
    // 404 by design.
    let Ok(session) = state.store.get_session(&session_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if session.status != SessionStatus::Running {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(user) = resolve_user(&state, &request).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state
        .store
        .get_project_member(&session.project_id, &user.id)
        .await
    {
        Ok(Some(_)) => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    let original_path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| original_path.clone());

    let client_ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    let mut headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .filter(|(name, _)| {
            name != "authorization"
                && name != "cookie"
                && name != CREDENTIALS_HEADER
                && name != "host"
                && name != "content-length"
                && name != "connection"
        })
        .collect();
    if let Some(ip) = client_ip {
        headers.push(("x-forwarded-for".into(), ip));
    }
    headers.push(("x-forwarded-host".into(), host));
    headers.push(("x-forwarded-proto".into(), "http".into()));
    headers.push(("x-forwarded-path".into(), original_path));

    let method = request.method().as_str().to_string();
    let body = request
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));

    let proxy_request = ProxyRequest {
        method,
        path: format!("/services/{service_id}/http{path_and_query}"),
        headers,
        body: Some(Box::pin(body)),
    };

    match state.provider.http_proxy(&session.id, proxy_request).await {
        Ok(response) => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            for (name, value) in &response.headers {
                let lowered = name.to_ascii_lowercase();
                if lowered == "connection"
                    || lowered == "transfer-encoding"
                    || lowered == "content-length"
                {
                    continue;
                }
                builder = builder.header(name, value);
            }
            let body = response
                .body
                .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));
            builder
                .body(Body::from_stream(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(err) => {
            tracing::warn!(session_id = %session.id, error = %err, "service proxy failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Cookie auth against the request being proxied; anonymous in no-auth
/// mode. Returns `None` (rendered as 404) when nothing resolves.
async fn resolve_user(state: &AppState, request: &Request) -> Option<User> {
    if !state.config.auth_enabled {
        return anonymous_user(state).await.ok();
    }
    let raw = request
        .headers()
        .get(header::COOKIE)?
        .to_str()
        .ok()?;
    let token = raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == SESSION_COOKIE).then(|| value.to_string())
    })?;
    let hash = crypto::hash_token(&token, &state.config.shared_secret_salt);
    let session = state.store.get_user_session_by_hash(&hash).await.ok()??;
    state.store.get_user(&session.user_id).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_service_hosts() {
        let (session, service) =
            parse_service_host("01HXYZ123456789ABCDEFGHIJK-svc-webapp.example.dev").unwrap();
        assert_eq!(session, "01HXYZ123456789ABCDEFGHIJK");
        assert_eq!(service, "webapp");
    }

    #[test]
    fn service_id_ends_at_the_first_dot() {
        let (_, service) =
            parse_service_host("01HXYZ123456789ABCDEFGHIJK-svc-api_v2.example.dev").unwrap();
        assert_eq!(service, "api_v2");
    }

    #[test]
    fn rejects_non_service_hosts() {
        assert!(parse_service_host("example.dev").is_none());
        assert!(parse_service_host("tooshort-svc-webapp.example.dev").is_none());
        assert!(
            parse_service_host("01HXYZ123456789ABCDEFGHIJ!-svc-webapp.example.dev").is_none()
        );
    }
}
