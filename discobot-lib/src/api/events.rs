//! Project event feed over SSE.
//!
//! The live subscription is taken before the replay query runs, so nothing
//! published in between is lost (duplicates are filtered by seq). Buffer
//! overflow on a slow client surfaces as a gap in the seq numbers it sees;
//! `?afterId=` replays the missed range on reconnect.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::auth::AuthUser;
use crate::api::{ApiResult, AppState, require_member};
use crate::model::ProjectEvent;

#[derive(Debug, Deserialize)]
pub struct EventStreamParams {
    /// Replay events after this event ID.
    #[serde(rename = "afterId")]
    pub after_id: Option<String>,
    /// Replay events created at or after this millisecond timestamp.
    pub since: Option<i64>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/projects/{pid}/events", get(event_stream))
}

fn frame(event: &ProjectEvent) -> Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Bytes::from(format!("data: {payload}\n\n"))
}

async fn event_stream(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Query(params): Query<EventStreamParams>,
) -> ApiResult<Response> {
    let project = require_member(&state, &pid, &user).await?;

    // Subscribe first; replay below fills the gap up to the live stream.
    let mut live = state.broker.subscribe(&project.id);
    let replay = if params.after_id.is_some() || params.since.is_some() {
        state
            .store
            .list_project_events_after_id(
                &project.id,
                params.after_id.as_deref(),
                params.since,
                1000,
            )
            .await?
    } else {
        Vec::new()
    };

    let broker = state.broker.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    tokio::spawn(async move {
        let connected = Bytes::from_static(b"data: {\"type\":\"connected\"}\n\n");
        if tx.send(Ok(connected)).await.is_err() {
            return;
        }

        let mut last_seq = 0i64;
        for event in &replay {
            last_seq = last_seq.max(event.seq);
            if tx.send(Ok(frame(event))).await.is_err() {
                return;
            }
        }

        loop {
            match live.recv().await {
                Ok(event) => {
                    // Events already replayed (or raced in twice) are skipped;
                    // delivery per subscriber stays seq-ordered.
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    if tx.send(Ok(frame(&event))).await.is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    broker.record_drop(missed);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}
