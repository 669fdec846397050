use std::time::Duration;

use crate::{DEFAULT_AGENT_HTTP_PORT, DEFAULT_AGENT_IMAGE, DEFAULT_START_TIMEOUT_SECS};

/// Knobs for the container backends. The control plane fills this from its
/// own configuration; tests construct it directly.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Image used when `CreateOpts.image` is empty.
    pub image: String,
    /// Host published container ports are reachable on.
    pub public_host: String,
    /// Port the agent-api listens on inside the container.
    pub agent_port: u16,
    /// Override for the Docker daemon address (`DOCKER_HOST` semantics).
    pub docker_host: Option<String>,
    /// Pull the image before first create.
    pub pull_image: bool,
    /// Ceiling on `start` waiting for the agent-api health endpoint.
    pub start_timeout: Duration,
    /// Path inside the container the workspace bind lands on.
    pub workspace_mount: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_AGENT_IMAGE.to_string(),
            public_host: "127.0.0.1".to_string(),
            agent_port: DEFAULT_AGENT_HTTP_PORT,
            docker_host: None,
            pull_image: true,
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            workspace_mount: "/workspace".to_string(),
        }
    }
}
