//! Persisted entities. Every entity carries an opaque 26-char string ID and
//! millisecond timestamps; status fields are closed string enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Part;

// ---------------------------------------------------------------------------
// Users and auth
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Identity provider tag; `(provider, provider_id)` is unique.
    pub provider: String,
    pub provider_id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct UserSession {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: i64,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(MemberRole::Owner),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectMember {
    pub project_id: String,
    pub user_id: String,
    pub role: MemberRole,
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceSource {
    Local,
    Git,
}

impl WorkspaceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceSource::Local => "local",
            WorkspaceSource::Git => "git",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(WorkspaceSource::Local),
            "git" => Some(WorkspaceSource::Git),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Initializing,
    Cloning,
    Ready,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Initializing => "initializing",
            WorkspaceStatus::Cloning => "cloning",
            WorkspaceStatus::Ready => "ready",
            WorkspaceStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initializing" => Some(WorkspaceStatus::Initializing),
            "cloning" => Some(WorkspaceStatus::Cloning),
            "ready" => Some(WorkspaceStatus::Ready),
            "error" => Some(WorkspaceStatus::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// Working-tree location on the host (or clone destination for git).
    pub path: String,
    pub source_type: WorkspaceSource,
    /// Clone source for `git` workspaces.
    pub source_url: Option<String>,
    pub status: WorkspaceStatus,
    /// Head commit SHA once known.
    pub commit: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Sessions and messages
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Cloning,
    CreatingSandbox,
    StartingAgent,
    Running,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Cloning => "cloning",
            SessionStatus::CreatingSandbox => "creating_sandbox",
            SessionStatus::StartingAgent => "starting_agent",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initializing" => Some(SessionStatus::Initializing),
            "cloning" => Some(SessionStatus::Cloning),
            "creating_sandbox" => Some(SessionStatus::CreatingSandbox),
            "starting_agent" => Some(SessionStatus::StartingAgent),
            "running" => Some(SessionStatus::Running),
            "error" => Some(SessionStatus::Error),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }

    /// `error` and `closed` admit no further service-driven transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Closed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    None,
    Pending,
    Completed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::None => "none",
            CommitStatus::Pending => "pending",
            CommitStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(CommitStatus::None),
            "pending" => Some(CommitStatus::Pending),
            "completed" => Some(CommitStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub agent_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub commit_status: CommitStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// Immutable once written; ordered by `created_at` within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub parts: Vec<Part>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Agents and credentials
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// Free-form backend tag, e.g. a model family identifier.
    pub agent_type: String,
    pub system_prompt: Option<String>,
    pub is_default: bool,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    Http,
}

impl McpTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransport::Stdio => "stdio",
            McpTransport::Http => "http",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" => Some(McpTransport::Stdio),
            "http" => Some(McpTransport::Http),
            _ => None,
        }
    }
}

/// Tool provider configured on an agent; config is opaque to the control
/// plane and handed to the in-sandbox agent verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpServer {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub transport: McpTransport,
    pub config: Value,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Oauth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::ApiKey => "api_key",
            AuthType::Oauth => "oauth",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api_key" => Some(AuthType::ApiKey),
            "oauth" => Some(AuthType::Oauth),
            _ => None,
        }
    }
}

/// Project-scoped provider secret. `secret` holds the sealed ciphertext and
/// is skipped by serialization so it can never leak through an API response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub project_id: String,
    pub provider: String,
    pub auth_type: AuthType,
    #[serde(skip)]
    pub secret: String,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ContainerCreate,
    ContainerDestroy,
    WorkspaceInit,
    SessionInit,
    SessionCommit,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ContainerCreate => "container_create",
            JobType::ContainerDestroy => "container_destroy",
            JobType::WorkspaceInit => "workspace_init",
            JobType::SessionInit => "session_init",
            JobType::SessionCommit => "session_commit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "container_create" => Some(JobType::ContainerCreate),
            "container_destroy" => Some(JobType::ContainerDestroy),
            "workspace_init" => Some(JobType::WorkspaceInit),
            "session_init" => Some(JobType::SessionInit),
            "session_commit" => Some(JobType::SessionCommit),
            _ => None,
        }
    }

    pub const ALL: [JobType; 5] = [
        JobType::ContainerCreate,
        JobType::ContainerDestroy,
        JobType::WorkspaceInit,
        JobType::SessionInit,
        JobType::SessionCommit,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub payload: Value,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// `(resource_type, resource_id)` defines a mutual-exclusion class: at
    /// most one running job per pair.
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub created_at: i64,
}

/// Parameters for enqueueing a job; the queue fills in identity and clock.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: Value,
    pub priority: i64,
    pub max_attempts: i64,
    pub resource: Option<(String, String)>,
    /// Delay before the job becomes claimable; zero means immediately.
    pub delay_ms: i64,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: Value) -> Self {
        Self {
            job_type,
            payload,
            priority: 0,
            max_attempts: 3,
            resource: None,
            delay_ms: 0,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource = Some((resource_type.to_string(), resource_id.to_string()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherLeader {
    pub server_id: String,
    pub heartbeat_at: i64,
    pub acquired_at: i64,
}

// ---------------------------------------------------------------------------
// Events and terminal history
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectEvent {
    pub id: String,
    /// Globally increasing, assigned on insert. Clients must tolerate gaps.
    pub seq: i64,
    pub project_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub created_at: i64,
}

pub const EVENT_SESSION_UPDATED: &str = "session_updated";
pub const EVENT_WORKSPACE_UPDATED: &str = "workspace_updated";
pub const EVENT_STARTUP_TASK_UPDATED: &str = "startup_task_updated";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub id: String,
    pub session_id: String,
    /// Record kind, e.g. `input`, `output`, `resize`.
    pub kind: String,
    pub data: String,
    pub created_at: i64,
}
