//! In-memory provider used by the control-plane test suites.
//!
//! Sandboxes are plain records in a `DashMap`; chat completions replay a
//! scripted chunk sequence over the proxied SSE stream; exec calls answer
//! a handful of shell idioms so the SSH gateway can be tested end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, Result};
use crate::provider::{
    AttachOpts, CreateOpts, ExecOpts, ExecResult, ExecStream, Provider, ProxyRequest,
    ProxyResponse, Pty, PtyControl, SandboxHandle, SandboxStatus, UserInfo,
};

#[derive(Clone)]
struct MockSandbox {
    status: SandboxStatus,
    opts: CreateOpts,
}

pub struct MockProvider {
    sandboxes: DashMap<String, MockSandbox>,
    chat_script: Vec<serde_json::Value>,
    chat_delay: Duration,
    chat_cancels: DashMap<String, CancellationToken>,
    fail_start: bool,
    pub create_count: AtomicU64,
    pub start_count: AtomicU64,
    pub destroy_count: AtomicU64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_chat_script(vec![
            json!({"type": "start", "messageId": "msg-mock"}),
            json!({"type": "text-start", "id": "t0"}),
            json!({"type": "text-delta", "id": "t0", "delta": "Hello from the sandbox."}),
            json!({"type": "text-end", "id": "t0"}),
            json!({"type": "finish", "finishReason": "stop"}),
        ])
    }

    /// Provider whose chat stream replays exactly `chunks`, in order.
    pub fn with_chat_script(chunks: Vec<serde_json::Value>) -> Self {
        Self {
            sandboxes: DashMap::new(),
            chat_script: chunks,
            chat_delay: Duration::from_millis(5),
            chat_cancels: DashMap::new(),
            fail_start: false,
            create_count: AtomicU64::new(0),
            start_count: AtomicU64::new(0),
            destroy_count: AtomicU64::new(0),
        }
    }

    /// Provider whose `start` always reports the backend as unavailable.
    /// Used to exercise job retry paths.
    pub fn failing_start() -> Self {
        let mut provider = Self::new();
        provider.fail_start = true;
        provider
    }

    pub fn set_chat_delay(&mut self, delay: Duration) {
        self.chat_delay = delay;
    }

    fn handle(&self, session_id: &str, sandbox: &MockSandbox) -> SandboxHandle {
        let running = sandbox.status == SandboxStatus::Running;
        SandboxHandle {
            session_id: session_id.to_string(),
            status: sandbox.status,
            host: running.then(|| "127.0.0.1".to_string()),
            http_port: running.then_some(crate::DEFAULT_AGENT_HTTP_PORT),
        }
    }

    fn require_running(&self, session_id: &str) -> Result<()> {
        let sandbox = self
            .sandboxes
            .get(session_id)
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        if sandbox.status != SandboxStatus::Running {
            return Err(ProviderError::NotRunning(format!(
                "sandbox for '{session_id}' is not running"
            )));
        }
        Ok(())
    }

    fn json_response(status: u16, payload: serde_json::Value) -> ProxyResponse {
        let bytes = Bytes::from(payload.to_string());
        ProxyResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Box::pin(futures::stream::once(async move { Ok(bytes) })),
        }
    }

    fn chat_response(&self, session_id: &str) -> ProxyResponse {
        let cancel = CancellationToken::new();
        self.chat_cancels
            .insert(session_id.to_string(), cancel.clone());
        let script = self.chat_script.clone();
        let delay = self.chat_delay;
        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(16);
        tokio::spawn(async move {
            for chunk in script {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::time::sleep(delay).await;
                if tx
                    .send(Ok(Bytes::from(format!("data: {chunk}\n\n"))))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
        });
        ProxyResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
            body: Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)),
        }
    }
}

struct NoopPtyControl;

#[async_trait]
impl PtyControl for NoopPtyControl {
    async fn resize(&self, _rows: u16, _cols: u16) -> Result<()> {
        Ok(())
    }
}

/// Loopback stream: bytes written to stdin come back on stdout. Enough to
/// verify the SSH bridges move bytes in both directions.
fn loopback_stream() -> (
    std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (mut server_read, mut server_write) = tokio::io::split(server);
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut server_read, &mut server_write).await;
    });
    let (client_read, client_write) = tokio::io::split(client);
    (Box::pin(client_write), Box::pin(client_read))
}

#[async_trait]
impl Provider for MockProvider {
    async fn create(&self, session_id: &str, opts: &CreateOpts) -> Result<SandboxHandle> {
        self.create_count.fetch_add(1, Ordering::Relaxed);
        if let Some(existing) = self.sandboxes.get(session_id) {
            if existing.opts == *opts {
                return Ok(self.handle(session_id, &existing));
            }
            return Err(ProviderError::AlreadyExists(format!(
                "sandbox for '{session_id}' exists with different parameters"
            )));
        }
        let sandbox = MockSandbox {
            status: SandboxStatus::Creating,
            opts: opts.clone(),
        };
        self.sandboxes
            .insert(session_id.to_string(), sandbox.clone());
        Ok(self.handle(session_id, &sandbox))
    }

    async fn start(&self, session_id: &str) -> Result<SandboxHandle> {
        self.start_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_start {
            return Err(ProviderError::BackendUnavailable(
                "mock start failure".into(),
            ));
        }
        let mut sandbox = self
            .sandboxes
            .get_mut(session_id)
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        sandbox.status = SandboxStatus::Running;
        let sandbox = sandbox.clone();
        Ok(self.handle(session_id, &sandbox))
    }

    async fn get(&self, session_id: &str) -> Result<SandboxHandle> {
        let sandbox = self
            .sandboxes
            .get(session_id)
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        Ok(self.handle(session_id, &sandbox))
    }

    async fn stop(&self, session_id: &str, _timeout: Duration) -> Result<()> {
        if let Some(mut sandbox) = self.sandboxes.get_mut(session_id) {
            sandbox.status = SandboxStatus::Stopped;
        }
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        self.destroy_count.fetch_add(1, Ordering::Relaxed);
        self.sandboxes.remove(session_id);
        Ok(())
    }

    async fn exec(&self, session_id: &str, argv: &[String], opts: ExecOpts) -> Result<ExecResult> {
        self.require_running(session_id)?;
        let _ = &opts;
        // Enough shell to satisfy the gateway and workspace paths.
        let (stdout, exit_code) = match argv.first().map(String::as_str) {
            Some("echo") => (format!("{}\n", argv[1..].join(" ")), 0),
            Some("true") => (String::new(), 0),
            Some("false") => (String::new(), 1),
            Some("/bin/sh") if argv.len() == 3 && argv[1] == "-c" => {
                let script = argv[2].as_str();
                if script.contains("id -un") {
                    ("agent 1000 1000".to_string(), 0)
                } else if let Some(rest) = script.strip_prefix("echo ") {
                    (format!("{rest}\n"), 0)
                } else if script == "false" {
                    (String::new(), 1)
                } else {
                    (String::new(), 0)
                }
            }
            _ => (String::new(), 0),
        };
        Ok(ExecResult {
            stdout: Bytes::from(stdout),
            stderr: Bytes::new(),
            exit_code,
        })
    }

    async fn exec_stream(
        &self,
        session_id: &str,
        _argv: &[String],
        _opts: ExecOpts,
    ) -> Result<ExecStream> {
        self.require_running(session_id)?;
        let (stdin, stdout) = loopback_stream();
        Ok(ExecStream {
            stdin,
            stdout,
            exit: Box::pin(async { Ok(0) }),
        })
    }

    async fn attach(&self, session_id: &str, _opts: AttachOpts) -> Result<Pty> {
        self.require_running(session_id)?;
        let (stdin, stdout) = loopback_stream();
        Ok(Pty {
            stdin,
            stdout,
            control: Box::new(NoopPtyControl),
            exit: Box::pin(async { Ok(0) }),
        })
    }

    async fn http_proxy(&self, session_id: &str, req: ProxyRequest) -> Result<ProxyResponse> {
        self.require_running(session_id)?;
        let path = req.path.split('?').next().unwrap_or("");
        let response = match (req.method.as_str(), path) {
            ("GET", "/health") => Self::json_response(200, json!({"ok": true})),
            ("POST", "/agent/start") => Self::json_response(200, json!({"ok": true})),
            ("POST", "/chat") => self.chat_response(session_id),
            ("POST", "/chat/cancel") => {
                if let Some((_, cancel)) = self.chat_cancels.remove(session_id) {
                    cancel.cancel();
                }
                Self::json_response(200, json!({"ok": true}))
            }
            ("GET", "/services") => Self::json_response(
                200,
                json!({"services": [{"id": "webapp", "port": 3000, "status": "stopped"}]}),
            ),
            (_, p) if p.starts_with("/services/") => {
                // Service operations are opaque passthrough; echo the path
                // and headers so callers can assert what reached the
                // sandbox.
                let headers: serde_json::Map<String, serde_json::Value> = req
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), json!(v)))
                    .collect();
                Self::json_response(
                    200,
                    json!({"ok": true, "path": req.path, "headers": headers}),
                )
            }
            _ => Self::json_response(404, json!({"error": "not_found"})),
        };
        Ok(response)
    }

    async fn user_info(&self, session_id: &str) -> Result<UserInfo> {
        self.require_running(session_id)?;
        Ok(UserInfo {
            username: "agent".into(),
            uid: 1000,
            gid: 1000,
        })
    }
}
