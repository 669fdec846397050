//! `workspace_init`: drives a workspace from `initializing` to `ready`.
//!
//! Local workspaces only need their path to exist. Git workspaces clone
//! once (re-entry with an existing checkout skips the clone) and record the
//! head commit. Failures park the workspace in `error`; deleting and
//! recreating it is the documented recovery path.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::jobs::{JobHandler, payload_str};
use crate::model::{Job, JobType, Workspace, WorkspaceSource, WorkspaceStatus};
use crate::session::SessionService;

pub struct WorkspaceInitHandler {
    sessions: Arc<SessionService>,
}

impl WorkspaceInitHandler {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }

    async fn set_status(
        &self,
        workspace: &Workspace,
        status: WorkspaceStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let store = self.sessions.store();
        store
            .update_workspace_status(&workspace.id, status, error_message)
            .await?;
        if let Ok(updated) = store.get_workspace(&workspace.id).await {
            self.sessions.emit_workspace(&updated).await;
        }
        Ok(())
    }

    async fn init_local(&self, workspace: &Workspace) -> Result<()> {
        if !Path::new(&workspace.path).is_dir() {
            return Err(Error::InvalidRequest(format!(
                "workspace path '{}' does not exist",
                workspace.path
            )));
        }
        Ok(())
    }

    async fn init_git(&self, workspace: &Workspace) -> Result<()> {
        let source_url = workspace
            .source_url
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("git workspace has no source URL".into()))?;

        // Re-entry after a crash: an existing checkout is left alone.
        if !Path::new(&workspace.path).join(".git").is_dir() {
            let output = Command::new("git")
                .arg("clone")
                .arg(source_url)
                .arg(&workspace.path)
                .output()
                .await
                .map_err(|err| Error::Internal(format!("failed to spawn git: {err}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::InvalidRequest(format!(
                    "git clone failed: {}",
                    stderr.trim()
                )));
            }
        }

        // Best-effort head capture.
        if let Ok(output) = Command::new("git")
            .arg("-C")
            .arg(&workspace.path)
            .args(["rev-parse", "HEAD"])
            .output()
            .await
            && output.status.success()
        {
            let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !commit.is_empty() {
                self.sessions
                    .store()
                    .set_workspace_commit(&workspace.id, &commit)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for WorkspaceInitHandler {
    fn job_type(&self) -> JobType {
        JobType::WorkspaceInit
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let workspace_id = payload_str(job, "workspaceId")?;
        let workspace = self.sessions.store().get_workspace(&workspace_id).await?;
        if workspace.status == WorkspaceStatus::Ready {
            return Ok(());
        }

        let result = match workspace.source_type {
            WorkspaceSource::Local => self.init_local(&workspace).await,
            WorkspaceSource::Git => {
                self.set_status(&workspace, WorkspaceStatus::Cloning, None)
                    .await?;
                self.init_git(&workspace).await
            }
        };

        match result {
            Ok(()) => {
                self.set_status(&workspace, WorkspaceStatus::Ready, None)
                    .await?;
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.set_status(&workspace, WorkspaceStatus::Error, Some(&message))
                    .await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBroker;
    use crate::model::NewJob;
    use crate::store::Store;
    use sandbox_runtime::MockProvider;
    use std::time::Duration;

    async fn fixture() -> (WorkspaceInitHandler, Store, String) {
        let store = Store::open_in_memory().await.unwrap();
        let broker = EventBroker::new(
            store.clone(),
            128,
            Duration::from_millis(25),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let provider = Arc::new(MockProvider::new());
        let sessions = crate::session::SessionService::new(
            store.clone(),
            broker,
            provider,
            &Config::default(),
        );
        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        (WorkspaceInitHandler::new(sessions), store, project.id)
    }

    fn job_for(workspace_id: &str) -> Job {
        let new_job = NewJob::new(
            JobType::WorkspaceInit,
            serde_json::json!({"workspaceId": workspace_id}),
        );
        Job {
            id: "j1".into(),
            job_type: new_job.job_type,
            payload: new_job.payload,
            status: crate::model::JobStatus::Running,
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            error: None,
            worker_id: None,
            scheduled_at: 0,
            started_at: None,
            completed_at: None,
            resource_type: None,
            resource_id: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn local_workspace_with_existing_path_becomes_ready() {
        let (handler, store, project) = fixture().await;
        let dir = tempfile::tempdir().unwrap();
        let ws = store
            .create_workspace(
                &project,
                "main",
                dir.path().to_str().unwrap(),
                WorkspaceSource::Local,
                None,
            )
            .await
            .unwrap();

        handler.handle(&job_for(&ws.id)).await.unwrap();
        let ws = store.get_workspace(&ws.id).await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Ready);

        // Already-ready workspaces are a no-op.
        handler.handle(&job_for(&ws.id)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_local_path_parks_in_error() {
        let (handler, store, project) = fixture().await;
        let ws = store
            .create_workspace(
                &project,
                "main",
                "/definitely/not/a/real/path",
                WorkspaceSource::Local,
                None,
            )
            .await
            .unwrap();

        let err = handler.handle(&job_for(&ws.id)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        let ws = store.get_workspace(&ws.id).await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Error);
        assert!(ws.error_message.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn git_workspace_without_url_errors() {
        let (handler, store, project) = fixture().await;
        let ws = store
            .create_workspace(&project, "main", "/tmp/clone-dest", WorkspaceSource::Git, None)
            .await
            .unwrap();
        let err = handler.handle(&job_for(&ws.id)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        let ws = store.get_workspace(&ws.id).await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Error);
    }
}
