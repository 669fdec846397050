//! Chat surface: start a completion, stream it, rejoin it, cancel it.
//!
//! Responses speak the AI-SDK UI message stream protocol: each chunk as a
//! `data: <json>` SSE event, a `data: [DONE]` sentinel at the end, and the
//! `x-vercel-ai-ui-message-stream: v1` marker header.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::UI_STREAM_HEADER;
use crate::api::auth::AuthUser;
use crate::api::sessions::project_session;
use crate::api::{ApiError, ApiResult, AppState, require_member};
use crate::completion::Attached;
use crate::error::Error;
use crate::message::{Chunk, Part};
use crate::model::MessageRole;

#[derive(Debug, Deserialize)]
pub struct UiMessage {
    pub id: Option<String>,
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Session ID; an unknown or absent ID creates a new session.
    pub id: Option<String>,
    pub messages: Vec<UiMessage>,
    #[serde(rename = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{pid}/chat", post(chat))
        .route("/projects/{pid}/chat/{sid}/stream", get(stream))
        .route("/projects/{pid}/chat/{sid}/cancel", post(cancel))
}

async fn chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;

    // The last message must be the one user turn this completion answers.
    let last = body
        .messages
        .last()
        .ok_or_else(|| Error::InvalidRequest("messages must not be empty".into()))?;
    if MessageRole::parse(&last.role) != Some(MessageRole::User) {
        return Err(Error::InvalidRequest("last message must be a user message".into()).into());
    }
    let user_parts = last.parts.clone();

    // Reuse the session when the ID matches; otherwise create one (which
    // also enqueues its init job).
    let session = match &body.id {
        Some(sid) => match state.store.get_session(sid).await {
            Ok(session) if session.project_id == project.id => session,
            Ok(_) => return Err(Error::Forbidden("session in another project".into()).into()),
            Err(Error::NotFound(_)) => {
                new_session(&state, &project.id, &body).await?
            }
            Err(err) => return Err(err.into()),
        },
        None => new_session(&state, &project.id, &body).await?,
    };

    let agent_payload = json!({
        "id": session.id,
        "messages": body.messages.iter().map(|m| json!({
            "id": m.id,
            "role": m.role,
            "parts": m.parts,
        })).collect::<Vec<_>>(),
    });

    state
        .completions
        .start(&session.id, user_parts, agent_payload)
        .await?;

    let attached = state.completions.attach(&session.id);
    Ok(sse_response(attached))
}

async fn new_session(
    state: &AppState,
    project_id: &str,
    body: &ChatRequest,
) -> Result<crate::model::Session, ApiError> {
    let workspace_id = body
        .workspace_id
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("workspaceId is required for new sessions".into()))?;
    let name = Part::collect_text(&body.messages.last().map(|m| m.parts.clone()).unwrap_or_default())
        .chars()
        .take(80)
        .collect::<String>();
    let name = if name.is_empty() { "untitled".to_string() } else { name };
    // The UI streams against the ID it sent; adopt it when well-formed.
    Ok(state
        .sessions
        .create_session_with_id(
            body.id.as_deref(),
            project_id,
            workspace_id,
            body.agent_id.as_deref(),
            &name,
            None,
        )
        .await?)
}

/// Rejoin a (possibly still running) completion: full replay, then tail.
async fn stream(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;
    let session = state.store.get_session(&sid).await?;
    if session.project_id != project.id {
        return Err(Error::Forbidden("session in another project".into()).into());
    }

    let attached = state.completions.attach(&session.id);
    if attached.replay.is_empty() && attached.live.is_none() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(sse_response(attached))
}

async fn cancel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, sid)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let _session = project_session(&state, &project.id, &sid).await?;
    state.completions.cancel(&sid).await?;
    Ok(Json(json!({ "cancelled": true })))
}

// ---------------------------------------------------------------------------
// SSE plumbing
// ---------------------------------------------------------------------------

fn frame(chunk: &Chunk) -> Bytes {
    let payload = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".into());
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Replay the buffered chunks, follow the live channel to the terminal
/// chunk, then `[DONE]`. Client disconnects just drop the channel; the
/// completion task is unaffected.
fn sse_response(attached: Attached) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    tokio::spawn(async move {
        let Attached { replay, live } = attached;
        let mut terminal_seen = false;
        for chunk in &replay {
            terminal_seen = terminal_seen || chunk.is_terminal();
            if tx.send(Ok(frame(chunk))).await.is_err() {
                return;
            }
        }
        if !terminal_seen && let Some(mut live) = live {
            loop {
                match live.recv().await {
                    Ok(chunk) => {
                        let terminal = chunk.is_terminal();
                        if tx.send(Ok(frame(&chunk))).await.is_err() {
                            return;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(UI_STREAM_HEADER, "v1")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
