use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which container backend drives sandboxes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxBackend {
    Docker,
    Vm,
    Mock,
}

impl SandboxBackend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "docker" => Some(SandboxBackend::Docker),
            "vm" => Some(SandboxBackend::Vm),
            "mock" => Some(SandboxBackend::Mock),
            _ => None,
        }
    }
}

/// Process configuration. The environment carries only the closed option
/// list below; the timing knobs keep their defaults unless a test (or the
/// binary) overrides them on the struct.
#[derive(Clone, Debug)]
pub struct Config {
    pub http_addr: String,
    /// Empty disables the SSH gateway.
    pub ssh_addr: Option<String>,
    pub ssh_host_key_path: PathBuf,
    pub db_url: String,
    pub auth_enabled: bool,
    pub shared_secret_salt: String,
    pub sandbox_backend: SandboxBackend,
    pub sandbox_image: String,
    pub subdomain_base: String,
    pub event_retention: Duration,
    /// Stable dispatcher identity; defaults to a fresh ID per process.
    pub leader_id: Option<String>,
    pub log_level: String,

    // Timing and sizing knobs; defaults match the documented behavior.
    pub start_timeout: Duration,
    pub job_heartbeat_timeout: Duration,
    pub job_stale_after: Duration,
    pub leader_heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub event_poll_interval: Duration,
    pub sse_client_buffer: usize,
    pub job_worker_pool: usize,
    pub container_create_concurrency: usize,
    pub container_destroy_concurrency: usize,
    /// Backoff unit: the n-th retry waits `attempts × job_retry_backoff`.
    pub job_retry_backoff: Duration,
    /// Ceiling on waiting for a commit turn to produce a terminal chunk.
    pub commit_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3000".to_string(),
            ssh_addr: Some("0.0.0.0:2222".to_string()),
            ssh_host_key_path: PathBuf::from("./state/ssh_host_key"),
            db_url: "sqlite::memory:".to_string(),
            auth_enabled: false,
            shared_secret_salt: "development-salt".to_string(),
            sandbox_backend: SandboxBackend::Mock,
            sandbox_image: sandbox_runtime::DEFAULT_AGENT_IMAGE.to_string(),
            subdomain_base: "localhost".to_string(),
            event_retention: Duration::from_secs(72 * 3600),
            leader_id: None,
            log_level: "info".to_string(),
            start_timeout: Duration::from_secs(60),
            job_heartbeat_timeout: Duration::from_secs(30),
            job_stale_after: Duration::from_secs(300),
            leader_heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            event_poll_interval: Duration::from_millis(250),
            sse_client_buffer: 128,
            job_worker_pool: 8,
            container_create_concurrency: 4,
            container_destroy_concurrency: 2,
            job_retry_backoff: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Read the recognized environment options over the defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(addr) = env::var("HTTP_ADDR") {
            config.http_addr = normalize_addr(&addr);
        }
        if let Ok(addr) = env::var("SSH_ADDR") {
            config.ssh_addr = if addr.trim().is_empty() {
                None
            } else {
                Some(normalize_addr(&addr))
            };
        }
        if let Ok(path) = env::var("SSH_HOST_KEY_PATH") {
            config.ssh_host_key_path = PathBuf::from(path);
        }
        if let Ok(url) = env::var("DB_URL") {
            config.db_url = url;
        }
        if let Ok(value) = env::var("AUTH_ENABLED") {
            config.auth_enabled = value.eq_ignore_ascii_case("true");
        }
        if let Ok(salt) = env::var("SHARED_SECRET_SALT") {
            config.shared_secret_salt = salt;
        }
        if let Ok(value) = env::var("SANDBOX_BACKEND")
            && let Some(backend) = SandboxBackend::parse(&value)
        {
            config.sandbox_backend = backend;
        }
        if let Ok(image) = env::var("SANDBOX_IMAGE") {
            config.sandbox_image = image;
        }
        if let Ok(base) = env::var("SUBDOMAIN_BASE") {
            config.subdomain_base = base;
        }
        if let Ok(hours) = env::var("EVENT_RETENTION_HOURS")
            && let Ok(hours) = hours.parse::<u64>()
        {
            config.event_retention = Duration::from_secs(hours * 3600);
        }
        if let Ok(id) = env::var("LEADER_ID")
            && !id.trim().is_empty()
        {
            config.leader_id = Some(id);
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        config
    }
}

/// Accept both `:3000` and `host:3000` listen addresses.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_port() {
        assert_eq!(normalize_addr(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn backend_parse_is_closed() {
        assert_eq!(SandboxBackend::parse("docker"), Some(SandboxBackend::Docker));
        assert_eq!(SandboxBackend::parse("vm"), Some(SandboxBackend::Vm));
        assert_eq!(SandboxBackend::parse("mock"), Some(SandboxBackend::Mock));
        assert_eq!(SandboxBackend::parse("firecracker"), None);
    }
}
