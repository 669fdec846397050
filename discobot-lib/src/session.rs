//! Session service: owns the session state machine and composes workspace
//! readiness, sandbox provisioning, and agent start.
//!
//! All transitions run inside `session_init` jobs (resource-serialized per
//! session), so concurrent retries can never interleave. Every transition
//! emits a `session_updated` project event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_runtime::{CreateOpts, Provider, ProxyRequest, SandboxStatus};
use serde_json::json;

use crate::config::Config;
use crate::crypto;
use crate::error::{Error, Result};
use crate::events::EventBroker;
use crate::model::{
    EVENT_SESSION_UPDATED, EVENT_WORKSPACE_UPDATED, JobType, NewJob, Session, SessionStatus,
    Workspace, WorkspaceStatus,
};
use crate::store::Store;

pub struct SessionService {
    store: Store,
    broker: Arc<EventBroker>,
    provider: Arc<dyn Provider>,
    sandbox_image: String,
    shared_secret_salt: String,
    start_timeout: Duration,
}

impl SessionService {
    pub fn new(store: Store, broker: Arc<EventBroker>, provider: Arc<dyn Provider>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            provider,
            sandbox_image: config.sandbox_image.clone(),
            shared_secret_salt: config.shared_secret_salt.clone(),
            start_timeout: config.start_timeout,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Create a session row and enqueue the init job that will drive it to
    /// `running`.
    pub async fn create_session(
        &self,
        project_id: &str,
        workspace_id: &str,
        agent_id: Option<&str>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Session> {
        self.create_session_with_id(None, project_id, workspace_id, agent_id, name, description)
            .await
    }

    pub async fn create_session_with_id(
        &self,
        desired_id: Option<&str>,
        project_id: &str,
        workspace_id: &str,
        agent_id: Option<&str>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Session> {
        let workspace = self.store.get_workspace(workspace_id).await?;
        if workspace.status == WorkspaceStatus::Error {
            // A broken workspace blocks new sessions; delete and recreate it.
            return Err(Error::InvalidRequest(
                "workspace is in error state".into(),
            ));
        }
        let session = self
            .store
            .create_session_with_id(
                desired_id,
                project_id,
                workspace_id,
                agent_id,
                name,
                description,
            )
            .await?;
        self.store
            .enqueue_job(
                NewJob::new(
                    JobType::SessionInit,
                    json!({
                        "sessionId": session.id,
                        "workspaceId": workspace_id,
                        "agentId": agent_id,
                        "projectId": project_id,
                    }),
                )
                .max_attempts(5)
                .resource("session", &session.id),
            )
            .await?;
        self.emit_session(&session).await;
        Ok(session)
    }

    /// Mark the commit as requested and enqueue the commit job. The only
    /// path to `closed`.
    pub async fn request_commit(&self, session: &Session) -> Result<()> {
        if session.status != SessionStatus::Running {
            return Err(Error::conflict("session_not_running"));
        }
        self.store
            .set_session_commit_status(&session.id, crate::model::CommitStatus::Pending)
            .await?;
        let workspace = self.store.get_workspace(&session.workspace_id).await?;
        self.store
            .enqueue_job(
                NewJob::new(
                    JobType::SessionCommit,
                    json!({
                        "sessionId": session.id,
                        "projectId": session.project_id,
                        "baseCommit": workspace.commit,
                    }),
                )
                .resource("session", &session.id),
            )
            .await?;
        if let Ok(session) = self.store.get_session(&session.id).await {
            self.emit_session(&session).await;
        }
        Ok(())
    }

    /// Delete the session row and schedule sandbox teardown.
    pub async fn delete_session(&self, session: &Session) -> Result<()> {
        self.store.delete_session(&session.id).await?;
        self.store
            .enqueue_job(
                NewJob::new(
                    JobType::ContainerDestroy,
                    json!({
                        "sessionId": session.id,
                        "projectId": session.project_id,
                    }),
                )
                .resource("sandbox", &session.id),
            )
            .await?;
        Ok(())
    }

    // -- state machine ------------------------------------------------------

    pub async fn transition(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.store
            .update_session_status(session_id, status, error_message)
            .await?;
        if let Ok(session) = self.store.get_session(session_id).await {
            self.emit_session(&session).await;
        }
        Ok(())
    }

    pub async fn emit_session(&self, session: &Session) {
        let _ = self
            .broker
            .publish(
                &session.project_id,
                EVENT_SESSION_UPDATED,
                &json!({ "session": session }),
            )
            .await;
    }

    pub async fn emit_workspace(&self, workspace: &Workspace) {
        let _ = self
            .broker
            .publish(
                &workspace.project_id,
                EVENT_WORKSPACE_UPDATED,
                &json!({ "workspace": workspace }),
            )
            .await;
    }

    /// The `session_init` job body. Idempotent: re-entry after a crash
    /// re-reads the session and picks up where the state machine left off.
    pub async fn run_init(&self, session_id: &str) -> Result<()> {
        let session = self.store.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Ok(());
        }

        // Workspace first. A not-yet-ready workspace gets its own (higher
        // priority) init job and this job retries later.
        let workspace = self.store.get_workspace(&session.workspace_id).await?;
        match workspace.status {
            WorkspaceStatus::Ready => {}
            WorkspaceStatus::Error => {
                let message = workspace
                    .error_message
                    .as_deref()
                    .unwrap_or("workspace failed to initialize");
                self.transition(session_id, SessionStatus::Error, Some(message))
                    .await?;
                return Err(Error::InvalidRequest(message.to_string()));
            }
            _ => {
                if session.status != SessionStatus::Cloning {
                    self.transition(session_id, SessionStatus::Cloning, None).await?;
                }
                self.store
                    .enqueue_job(
                        NewJob::new(
                            JobType::WorkspaceInit,
                            json!({
                                "workspaceId": workspace.id,
                                "projectId": workspace.project_id,
                            }),
                        )
                        .priority(10)
                        .resource("workspace", &workspace.id),
                    )
                    .await?;
                return Err(Error::BackendUnavailable("workspace not ready yet".into()));
            }
        }

        match self.provision_and_start(&session, &workspace).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = if matches!(err, Error::StartTimeout(_)) {
                    "timed out waiting for agent".to_string()
                } else {
                    err.to_string()
                };
                self.transition(session_id, SessionStatus::Error, Some(&message))
                    .await?;
                Err(err)
            }
        }
    }

    async fn provision_and_start(&self, session: &Session, workspace: &Workspace) -> Result<()> {
        // Sandbox provisioning runs as its own resource-serialized job so
        // the dispatcher's container_create concurrency cap applies; this
        // job waits for the outcome.
        let sandbox_running = matches!(
            self.provider.get(&session.id).await,
            Ok(handle) if handle.status == SandboxStatus::Running
        );
        if !sandbox_running {
            self.transition(&session.id, SessionStatus::CreatingSandbox, None)
                .await?;
            self.store
                .enqueue_job(
                    NewJob::new(
                        JobType::ContainerCreate,
                        json!({
                            "sessionId": session.id,
                            "projectId": session.project_id,
                            "workspacePath": workspace.path,
                        }),
                    )
                    .priority(5)
                    .resource("sandbox", &session.id),
                )
                .await?;
            self.wait_for_sandbox(&session.id).await?;
        }
        // Idempotent for running sandboxes; blocks until the agent-api
        // health endpoint answers.
        self.provider.start(&session.id).await?;

        self.transition(&session.id, SessionStatus::StartingAgent, None)
            .await?;
        self.start_agent(session).await?;
        self.transition(&session.id, SessionStatus::Running, None)
            .await?;
        Ok(())
    }

    async fn wait_for_sandbox(&self, session_id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            if let Ok(handle) = self.provider.get(session_id).await
                && handle.status == SandboxStatus::Running
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::StartTimeout(format!(
                    "sandbox for '{session_id}' did not start in time"
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Creation opts for the session's sandbox; also used by the
    /// container_create handler so both paths agree (idempotent create).
    pub fn sandbox_opts(&self, workspace_path: &str) -> CreateOpts {
        CreateOpts {
            image: self.sandbox_image.clone(),
            env: BTreeMap::new(),
            cpu_cores: None,
            memory_mb: None,
            workspace_source: Some(workspace_path.to_string()),
            data_volume: None,
        }
    }

    /// Boot the in-sandbox agent: agent type, system prompt, MCP servers,
    /// and the project's resolved credential env.
    async fn start_agent(&self, session: &Session) -> Result<()> {
        let (agent_type, system_prompt, mcp_servers) = match &session.agent_id {
            Some(agent_id) => {
                let agent = self.store.get_agent(agent_id).await?;
                let servers = self.store.list_mcp_servers(agent_id).await?;
                (agent.agent_type, agent.system_prompt, servers)
            }
            None => match self.store.get_default_agent(&session.project_id).await? {
                Some(agent) => {
                    let servers = self.store.list_mcp_servers(&agent.id).await?;
                    (agent.agent_type, agent.system_prompt, servers)
                }
                None => ("default".to_string(), None, Vec::new()),
            },
        };

        let env = self.credential_env(&session.project_id).await?;
        let payload = json!({
            "agentType": agent_type,
            "systemPrompt": system_prompt,
            "mcpServers": mcp_servers,
            "env": env,
        });
        let request = ProxyRequest::post_json("/agent/start", &payload);
        let response = self.provider.http_proxy(&session.id, request).await?;
        if response.status >= 400 {
            return Err(Error::BackendUnavailable(format!(
                "agent start returned HTTP {}",
                response.status
            )));
        }
        Ok(())
    }

    /// Decrypt project credentials into the env map handed to the agent.
    async fn credential_env(&self, project_id: &str) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for credential in self.store.list_credentials(project_id).await? {
            let secret = crypto::decrypt_secret(&credential.secret, &self.shared_secret_salt)?;
            let prefix: String = credential
                .provider
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            let key = match credential.auth_type {
                crate::model::AuthType::ApiKey => format!("{prefix}_API_KEY"),
                crate::model::AuthType::Oauth => format!("{prefix}_OAUTH_TOKEN"),
            };
            env.insert(key, secret);
        }
        Ok(env)
    }
}
