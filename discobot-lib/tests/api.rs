//! End-to-end API tests against the full stack: in-memory store, mock
//! sandbox provider, live dispatcher, event broker, and the real router
//! with the subdomain proxy in front: everything short of real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode, header};
use discobot_lib::api::{self, AppState};
use discobot_lib::completion::CompletionService;
use discobot_lib::events::EventBroker;
use discobot_lib::jobs::{Dispatcher, default_handlers};
use discobot_lib::model::{JobType, SessionStatus, WorkspaceStatus};
use discobot_lib::session::SessionService;
use discobot_lib::store::Store;
use discobot_lib::{ANONYMOUS_USER_ID, Config, subdomain};
use http_body_util::BodyExt;
use sandbox_runtime::MockProvider;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestStack {
    app: Router,
    store: Store,
    state: AppState,
    project_id: String,
    workspace_id: String,
    shutdown: CancellationToken,
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn stack() -> TestStack {
    stack_with_provider(Arc::new(MockProvider::new())).await
}

async fn stack_with_provider(provider: Arc<MockProvider>) -> TestStack {
    let mut config = Config::default();
    config.poll_interval = Duration::from_millis(20);
    config.leader_heartbeat_interval = Duration::from_millis(50);
    config.event_poll_interval = Duration::from_millis(25);
    config.start_timeout = Duration::from_secs(5);
    config.job_retry_backoff = Duration::from_millis(50);

    let store = Store::open_in_memory().await.unwrap();
    let broker = EventBroker::new(
        store.clone(),
        config.sse_client_buffer,
        config.event_poll_interval,
        config.event_retention,
    )
    .await
    .unwrap();

    let sessions = SessionService::new(store.clone(), broker.clone(), provider.clone(), &config);
    let completions = CompletionService::new(
        store.clone(),
        broker.clone(),
        provider.clone(),
        Duration::from_secs(5),
    );

    let shutdown = CancellationToken::new();
    let handlers = default_handlers(sessions.clone(), completions.clone(), config.commit_timeout);
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), &config, handlers);
    tokio::spawn(dispatcher.run(shutdown.clone()));
    tokio::spawn(broker.clone().run_poller(shutdown.clone()));

    // No-auth mode: the anonymous user owns the seeded project.
    let anonymous = store
        .ensure_user("anonymous", ANONYMOUS_USER_ID, "Anonymous")
        .await
        .unwrap();
    let project = store
        .create_project("p1", "Project One", &anonymous.id)
        .await
        .unwrap();
    // A ready local workspace (the path is this crate's directory, which
    // certainly exists).
    let workspace = store
        .create_workspace(
            &project.id,
            "main",
            env!("CARGO_MANIFEST_DIR"),
            discobot_lib::model::WorkspaceSource::Local,
            None,
        )
        .await
        .unwrap();
    store
        .update_workspace_status(&workspace.id, WorkspaceStatus::Ready, None)
        .await
        .unwrap();

    let state = AppState {
        store: store.clone(),
        broker,
        provider,
        sessions,
        completions,
        config: Arc::new(config),
    };
    let app = api::router(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            subdomain::middleware,
        ))
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));

    TestStack {
        app,
        store,
        state,
        project_id: project.id,
        workspace_id: workspace.id,
        shutdown,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

fn chat_body(stack: &TestStack, text: &str) -> Value {
    json!({
        "messages": [{
            "id": "m1",
            "role": "user",
            "parts": [{"type": "text", "text": text}],
        }],
        "workspaceId": stack.workspace_id,
    })
}

async fn wait_for_session_status(store: &Store, session_id: &str, status: SessionStatus) {
    for _ in 0..300 {
        if store.get_session(session_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never reached {status:?}");
}

// ---------------------------------------------------------------------------
// Chat flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_happy_path_streams_to_done() {
    // A fresh chat provisions a session and streams through [DONE].
    let stack = stack().await;
    let uri = format!("/projects/{}/chat", stack.project_id);
    let response = stack
        .app
        .clone()
        .oneshot(post_json(&uri, chat_body(&stack, "hi")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-vercel-ai-ui-message-stream")
            .and_then(|v| v.to_str().ok()),
        Some("v1")
    );

    let body = text_body(response).await;
    assert!(body.contains("text-delta"), "body was: {body}");
    assert!(body.contains("finish"));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // The session went through the state machine and both turns persisted.
    let sessions = stack
        .store
        .list_sessions(&stack.project_id, None, true)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Running);
    let messages = stack.store.list_messages(&sessions[0].id).await.unwrap();
    assert_eq!(messages.len(), 2);

    // Every transition produced a session_updated event.
    let events = stack
        .store
        .list_project_events_after_id(&stack.project_id, None, None, 1000)
        .await
        .unwrap();
    let session_updates = events
        .iter()
        .filter(|e| e.event_type == "session_updated")
        .count();
    assert!(session_updates >= 3, "only {session_updates} updates");
}

#[tokio::test]
async fn chat_conflict_returns_409_with_completion_id() {
    // A second POST against a streaming session conflicts. The slow
    // script keeps the first completion's slot held long enough to race.
    let mut provider = MockProvider::with_chat_script(vec![
        json!({"type": "text-start", "id": "t"}),
        json!({"type": "text-delta", "id": "t", "delta": "slow"}),
        json!({"type": "text-delta", "id": "t", "delta": "slower"}),
        json!({"type": "text-end", "id": "t"}),
        json!({"type": "finish", "finishReason": "stop"}),
    ]);
    provider.set_chat_delay(Duration::from_millis(250));
    let stack = stack_with_provider(Arc::new(provider)).await;
    let uri = format!("/projects/{}/chat", stack.project_id);

    // First chat: fire and let it get going (its stream stays open).
    let app = stack.app.clone();
    let first_body = chat_body(&stack, "one");
    let first_uri = uri.clone();
    let first = tokio::spawn(async move {
        let _ = app.oneshot(post_json(&first_uri, first_body)).await;
    });

    // Wait for the session to exist and the slot to be claimed.
    let mut session_id = None;
    for _ in 0..300 {
        let sessions = stack
            .store
            .list_sessions(&stack.project_id, None, true)
            .await
            .unwrap();
        if let Some(session) = sessions.first() {
            let (running, _) = stack.state.completions.status(&session.id);
            if running {
                session_id = Some(session.id.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let session_id = session_id.expect("completion never started");

    let mut body = chat_body(&stack, "two");
    body["id"] = json!(session_id);
    let response = stack.app.clone().oneshot(post_json(&uri, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let payload = json_body(response).await;
    assert_eq!(payload["error"], "completion_in_progress");
    assert!(payload["completionId"].is_string());
    first.abort();
}

#[tokio::test]
async fn stream_rejoins_with_full_replay() {
    // After the completion finishes with no client attached, the
    // stream endpoint replays everything and terminates.
    let stack = stack().await;
    let uri = format!("/projects/{}/chat", stack.project_id);
    let response = stack
        .app
        .clone()
        .oneshot(post_json(&uri, chat_body(&stack, "hi")))
        .await
        .unwrap();
    let _ = text_body(response).await;

    let session = &stack
        .store
        .list_sessions(&stack.project_id, None, true)
        .await
        .unwrap()[0];
    let stream_uri = format!("/projects/{}/chat/{}/stream", stack.project_id, session.id);
    let response = stack.app.clone().oneshot(get(&stream_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = text_body(response).await;
    assert!(body.contains("\"type\":\"start\""));
    assert!(body.contains("text-delta"));
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn stream_of_unknown_session_is_404_and_idle_session_204() {
    let stack = stack().await;
    let uri = format!(
        "/projects/{}/chat/00000000000000000000000000/stream",
        stack.project_id
    );
    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // A session that never chatted: 204.
    let session = stack
        .store
        .create_session(&stack.project_id, &stack.workspace_id, None, "idle", None)
        .await
        .unwrap();
    let uri = format!("/projects/{}/chat/{}/stream", stack.project_id, session.id);
    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn stream_across_projects_is_forbidden() {
    // A session from another project is never streamable.
    let stack = stack().await;
    let anonymous = stack
        .store
        .get_user_by_provider("anonymous", ANONYMOUS_USER_ID)
        .await
        .unwrap()
        .unwrap();
    let other = stack
        .store
        .create_project("p2", "Project Two", &anonymous.id)
        .await
        .unwrap();
    let session = stack
        .store
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();

    let uri = format!("/projects/{}/chat/{}/stream", other.id, session.id);
    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let payload = json_body(response).await;
    assert_eq!(payload["error"], "forbidden");
}

#[tokio::test]
async fn cancel_without_active_completion_conflicts() {
    let stack = stack().await;
    let session = stack
        .store
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();
    let uri = format!("/projects/{}/chat/{}/cancel", stack.project_id, session.id);
    let response = stack
        .app
        .clone()
        .oneshot(post_json(&uri, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"], "no_active_completion");
}

// ---------------------------------------------------------------------------
// Subdomain proxy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subdomain_proxy_strips_credentials_and_sets_forwarded_path() {
    // The proxied service receives the request without credentials.
    let stack = stack().await;
    let session = stack
        .state
        .sessions
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();
    wait_for_session_status(&stack.store, &session.id, SessionStatus::Running).await;

    let host = format!("{}-svc-webapp.example.dev", session.id);
    let request = Request::builder()
        .uri("/foo")
        .header(header::HOST, host)
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .header(header::COOKIE, "discobot_session=tok")
        .header("x-discobot-credentials", "leak")
        .body(Body::empty())
        .unwrap();
    let response = stack.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = json_body(response).await;
    assert_eq!(payload["path"], "/services/webapp/http/foo");
    let headers = payload["headers"].as_object().unwrap();
    assert!(!headers.contains_key("authorization"));
    assert!(!headers.contains_key("cookie"));
    assert!(!headers.contains_key("x-discobot-credentials"));
    assert_eq!(headers["x-forwarded-path"], "/foo");
    assert_eq!(
        headers["x-forwarded-host"],
        format!("{}-svc-webapp.example.dev", session.id)
    );
}

#[tokio::test]
async fn subdomain_proxy_404s_sessions_that_are_not_running() {
    let stack = stack().await;
    let session = stack
        .store
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();
    // Still initializing (or racing the dispatcher); stop the sandbox to
    // force not-running deterministically.
    stack
        .store
        .update_session_status(&session.id, SessionStatus::Error, Some("x"))
        .await
        .unwrap();

    let host = format!("{}-svc-webapp.example.dev", session.id);
    let request = Request::builder()
        .uri("/foo")
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap();
    let response = stack.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Sessions, workspaces, system
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_lifecycle_via_api() {
    let stack = stack().await;
    let uri = format!("/projects/{}/sessions", stack.project_id);
    let response = stack
        .app
        .clone()
        .oneshot(post_json(
            &uri,
            json!({"workspaceId": stack.workspace_id, "name": "mine"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = json_body(response).await;
    let session_id = created["id"].as_str().unwrap().to_string();

    // The dispatcher drives it to running.
    wait_for_session_status(&stack.store, &session_id, SessionStatus::Running).await;

    // Commit archives it.
    let commit_uri = format!(
        "/projects/{}/sessions/{}/commit",
        stack.project_id, session_id
    );
    let response = stack
        .app
        .clone()
        .oneshot(post_json(&commit_uri, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for_session_status(&stack.store, &session_id, SessionStatus::Closed).await;

    // Closed sessions disappear from the default listing.
    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    let listed = json_body(response).await;
    assert!(listed.as_array().unwrap().is_empty());
    let response = stack
        .app
        .clone()
        .oneshot(get(&format!("{uri}?includeClosed=true")))
        .await
        .unwrap();
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn workspace_delete_requires_cascade_when_sessions_exist() {
    let stack = stack().await;
    stack
        .store
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();

    let uri = format!(
        "/projects/{}/workspaces/{}",
        stack.project_id, stack.workspace_id
    );
    let response = stack
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(&uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"], "workspace_has_sessions");

    let response = stack
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("{uri}?cascade=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(stack
        .store
        .get_workspace(&stack.workspace_id)
        .await
        .is_err());
    // Sandbox teardown got queued for the cascaded session.
    let destroy = stack
        .store
        .claim_job_of_types(&[JobType::ContainerDestroy], "t")
        .await
        .unwrap();
    assert!(destroy.is_some());
}

#[tokio::test]
async fn system_status_reports_startup_tasks() {
    let stack = stack().await;
    // Enqueue a session so at least one job is visible (racing the
    // dispatcher is fine; pending or running both count).
    stack
        .state
        .sessions
        .create_session(&stack.project_id, &stack.workspace_id, None, "s", None)
        .await
        .unwrap();

    let uri = format!("/projects/{}/system/status", stack.project_id);
    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = json_body(response).await;
    assert_eq!(payload["ok"], true);
    assert!(payload["startupTasks"].is_array());
}

#[tokio::test]
async fn credentials_never_return_secrets() {
    let stack = stack().await;
    let uri = format!("/projects/{}/credentials", stack.project_id);
    let response = stack
        .app
        .clone()
        .oneshot(post_json(
            &uri,
            json!({"provider": "anthropic", "authType": "api_key", "secret": "sk-very-secret"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = json_body(response).await;
    assert!(created.get("secret").is_none());

    let response = stack.app.clone().oneshot(get(&uri)).await.unwrap();
    let body = text_body(response).await;
    assert!(!body.contains("sk-very-secret"));
    assert!(body.contains("anthropic"));
}

#[tokio::test]
async fn project_events_sse_replays_with_after_id() {
    let stack = stack().await;
    let first = stack
        .state
        .broker
        .publish(&stack.project_id, "session_updated", &json!({"n": 1}))
        .await
        .unwrap();
    let second = stack
        .state
        .broker
        .publish(&stack.project_id, "workspace_updated", &json!({"n": 2}))
        .await
        .unwrap();

    // The SSE response never closes on its own; read with a deadline
    // through a real socket instead of oneshot collect.
    let app = stack.app.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!(
        "GET /projects/{}/events?afterId={} HTTP/1.1\r\nHost: {addr}\r\n\r\n",
        stack.project_id, first.id
    );
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut buf = [0u8; 4096];
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), socket.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains(&second.id) {
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(collected.contains("\"type\":\"connected\""), "{collected}");
    assert!(!collected.contains(&first.id));
    assert!(collected.contains(&second.id));
}
