use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Streaming body: request bodies flow into the sandbox, response bodies
/// flow out, neither is buffered in full.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Sandbox lifecycle states as reported by `get`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Destroyed,
}

/// Parameters for `create`. The same session with identical opts is a
/// no-op on re-create; differing opts fail with `already_exists`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOpts {
    pub image: String,
    /// Env injected at container start. BTreeMap so the opts hash used for
    /// idempotency checks is deterministic.
    pub env: BTreeMap<String, String>,
    pub cpu_cores: Option<u64>,
    pub memory_mb: Option<u64>,
    /// Host path bind-mounted at the workspace mount point.
    pub workspace_source: Option<String>,
    /// Named volume for persistent per-session data.
    pub data_volume: Option<String>,
}

/// Current status plus network coordinates of a sandbox.
#[derive(Clone, Debug)]
pub struct SandboxHandle {
    pub session_id: String,
    pub status: SandboxStatus,
    /// Host the agent-api is reachable on, when running.
    pub host: Option<String>,
    /// Published agent-api port, when running.
    pub http_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecOpts {
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Bytes>,
    /// `"uid:gid"`; empty means the container's default user.
    pub user: String,
}

#[derive(Clone, Debug)]
pub struct ExecResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i64,
}

#[derive(Clone, Debug, Default)]
pub struct AttachOpts {
    pub env: BTreeMap<String, String>,
    pub rows: u16,
    pub cols: u16,
    pub user: String,
}

/// Bidirectional byte stream to a process inside the sandbox.
pub struct ExecStream {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    /// Resolves with the process exit code once it terminates.
    pub exit: Pin<Box<dyn Future<Output = Result<i64>> + Send>>,
}

impl ExecStream {
    /// Half-close: signal EOF on the process stdin while stdout keeps flowing.
    pub async fn close_write(&mut self) -> std::io::Result<()> {
        self.stdin.shutdown().await
    }
}

/// Backend hook for PTY resize.
#[async_trait]
pub trait PtyControl: Send + Sync {
    async fn resize(&self, rows: u16, cols: u16) -> Result<()>;
}

/// An attached PTY: byte-transparent in both directions plus resize.
pub struct Pty {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub control: Box<dyn PtyControl>,
    pub exit: Pin<Box<dyn Future<Output = Result<i64>> + Send>>,
}

/// HTTP request forwarded into the sandbox (agent-api or a service port).
pub struct ProxyRequest {
    pub method: String,
    /// Path plus query string, beginning with `/`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<ByteStream>,
}

impl ProxyRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(path: impl Into<String>, payload: &serde_json::Value) -> Self {
        let bytes = Bytes::from(payload.to_string());
        Self {
            method: "POST".into(),
            path: path.into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(Box::pin(futures::stream::once(async move { Ok(bytes) }))),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
}

impl ProxyResponse {
    /// Drain the body and parse it as JSON. For small control responses only.
    pub async fn into_json(self) -> Result<serde_json::Value> {
        use futures::StreamExt;
        let mut buf = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| crate::ProviderError::Io(err.to_string()))?;
            buf.extend_from_slice(&chunk);
        }
        serde_json::from_slice(&buf)
            .map_err(|err| crate::ProviderError::Io(format!("invalid response JSON: {err}")))
    }
}

/// Default in-sandbox user identity, used to run SSH sessions as that user.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
}

impl UserInfo {
    /// `"uid:gid"` form expected by exec opts; empty when unknown.
    pub fn user_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

/// Backend contract for per-session sandboxes.
///
/// Implementations must be safe to call concurrently; each operation takes
/// effect against the sandbox owned by `session_id`. Cancellation is
/// cooperative: dropping the returned future abandons the operation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create the sandbox container. Idempotent for identical `opts`.
    async fn create(&self, session_id: &str, opts: &CreateOpts) -> Result<SandboxHandle>;

    /// Run the container and wait until the in-sandbox agent-api answers
    /// its health endpoint, or `start_timeout` elapses.
    async fn start(&self, session_id: &str) -> Result<SandboxHandle>;

    async fn get(&self, session_id: &str) -> Result<SandboxHandle>;

    /// Graceful stop; forceful kill after `timeout`.
    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()>;

    /// Remove container and state. No-op for stopped or unknown sessions.
    async fn destroy(&self, session_id: &str) -> Result<()>;

    async fn exec(&self, session_id: &str, argv: &[String], opts: ExecOpts) -> Result<ExecResult>;

    async fn exec_stream(
        &self,
        session_id: &str,
        argv: &[String],
        opts: ExecOpts,
    ) -> Result<ExecStream>;

    async fn attach(&self, session_id: &str, opts: AttachOpts) -> Result<Pty>;

    /// Transparently proxy an HTTP request to the sandbox's agent-api.
    async fn http_proxy(&self, session_id: &str, req: ProxyRequest) -> Result<ProxyResponse>;

    async fn user_info(&self, session_id: &str) -> Result<UserInfo>;
}
