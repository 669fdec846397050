use std::fmt;

use sandbox_runtime::ProviderError;

/// Control-plane error taxonomy. Each kind maps to exactly one HTTP status
/// and one snake_case wire code; see `api::ApiError` for the envelope.
#[derive(Debug)]
pub enum Error {
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    InvalidRequest(String),
    /// Domain conflicts: `completion_in_progress`, `no_active_completion`,
    /// `service_already_running`, ... The code is the wire error string;
    /// `details` is merged into the response envelope.
    Conflict {
        code: &'static str,
        details: Option<serde_json::Value>,
    },
    /// Sandbox backend or database unreachable.
    BackendUnavailable(String),
    /// The in-sandbox agent never became healthy.
    StartTimeout(String),
    Storage(String),
    Internal(String),
}

impl Error {
    pub fn conflict(code: &'static str) -> Self {
        Error::Conflict {
            code,
            details: None,
        }
    }

    pub fn conflict_with(code: &'static str, details: serde_json::Value) -> Self {
        Error::Conflict {
            code,
            details: Some(details),
        }
    }

    /// Wire code used in the `{"error": ...}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Conflict { code, .. } => code,
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::StartTimeout(_) => "start_timeout",
            Error::Storage(_) | Error::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Error::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Error::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Error::Conflict { code, .. } => write!(f, "conflict: {code}"),
            Error::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Error::StartTimeout(msg) => write!(f, "start timeout: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Error::BackendUnavailable(format!("database: {err}"))
            }
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => Error::NotFound(msg),
            ProviderError::AlreadyExists(msg) => Error::Conflict {
                code: "already_exists",
                details: Some(serde_json::json!({ "message": msg })),
            },
            ProviderError::NotRunning(msg) => Error::conflict_with(
                "not_running",
                serde_json::json!({ "message": msg }),
            ),
            ProviderError::StartTimeout(msg) => Error::StartTimeout(msg),
            ProviderError::ExecFailed(msg) => Error::Internal(msg),
            ProviderError::Io(msg) => Error::Internal(msg),
            ProviderError::BackendUnavailable(msg) => Error::BackendUnavailable(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
