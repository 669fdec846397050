//! Backend-neutral sandbox container runtime.
//!
//! This crate provides the `Provider` contract the control plane talks to:
//! per-session container lifecycle, command execution (buffered, streamed,
//! and PTY-attached), and a transparent HTTP proxy into the in-sandbox
//! agent-api. Two backends ship here: Docker and an in-memory mock used
//! by the test suites.

pub mod config;
pub mod docker;
pub mod error;
pub mod mock;
pub mod provider;

pub use config::RuntimeConfig;
pub use docker::DockerProvider;
pub use error::{ProviderError, Result};
pub use mock::MockProvider;
pub use provider::{
    AttachOpts, ByteStream, CreateOpts, ExecOpts, ExecResult, ExecStream, Provider, ProxyRequest,
    ProxyResponse, Pty, PtyControl, SandboxHandle, SandboxStatus, UserInfo,
};

pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/discobot/sandbox:latest";
pub const DEFAULT_AGENT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 60;
