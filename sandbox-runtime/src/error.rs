use std::fmt;

/// Errors returned by sandbox provider operations.
#[derive(Debug)]
pub enum ProviderError {
    /// No sandbox exists for the given session.
    NotFound(String),
    /// A sandbox already exists for the session with different parameters.
    AlreadyExists(String),
    /// The sandbox exists but is not running.
    NotRunning(String),
    /// The in-sandbox agent-api did not become healthy in time.
    StartTimeout(String),
    /// A command inside the sandbox failed to launch or attach.
    ExecFailed(String),
    /// Byte-level I/O failure while talking to the sandbox.
    Io(String),
    /// The container backend itself is unreachable.
    BackendUnavailable(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProviderError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            ProviderError::NotRunning(msg) => write!(f, "not running: {msg}"),
            ProviderError::StartTimeout(msg) => write!(f, "start timeout: {msg}"),
            ProviderError::ExecFailed(msg) => write!(f, "exec failed: {msg}"),
            ProviderError::Io(msg) => write!(f, "io error: {msg}"),
            ProviderError::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Stable snake_case code for API error envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::NotFound(_) => "not_found",
            ProviderError::AlreadyExists(_) => "already_exists",
            ProviderError::NotRunning(_) => "not_running",
            ProviderError::StartTimeout(_) => "start_timeout",
            ProviderError::ExecFailed(_) => "exec_failed",
            ProviderError::Io(_) => "io_error",
            ProviderError::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
