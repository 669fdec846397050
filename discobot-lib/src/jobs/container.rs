//! `container_create` / `container_destroy`: sandbox lifecycle jobs.
//!
//! Both are idempotent by way of the Provider contract: re-creating with
//! identical opts is a no-op and destroying an unknown sandbox succeeds.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::{JobHandler, payload_str};
use crate::model::{Job, JobType};
use crate::session::SessionService;

pub struct ContainerCreateHandler {
    sessions: Arc<SessionService>,
}

impl ContainerCreateHandler {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl JobHandler for ContainerCreateHandler {
    fn job_type(&self) -> JobType {
        JobType::ContainerCreate
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let session_id = payload_str(job, "sessionId")?;
        let workspace_path = payload_str(job, "workspacePath")?;
        let opts = self.sessions.sandbox_opts(&workspace_path);
        self.sessions.provider().create(&session_id, &opts).await?;
        self.sessions.provider().start(&session_id).await?;
        Ok(())
    }
}

pub struct ContainerDestroyHandler {
    sessions: Arc<SessionService>,
}

impl ContainerDestroyHandler {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl JobHandler for ContainerDestroyHandler {
    fn job_type(&self) -> JobType {
        JobType::ContainerDestroy
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let session_id = payload_str(job, "sessionId")?;
        self.sessions.provider().destroy(&session_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBroker;
    use crate::model::NewJob;
    use crate::store::Store;
    use sandbox_runtime::{MockProvider, Provider, SandboxStatus};
    use std::time::Duration;

    async fn handler_fixture() -> (ContainerCreateHandler, ContainerDestroyHandler, Arc<MockProvider>) {
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
        let sessions =
            crate::session::SessionService::new(store, broker, provider.clone(), &Config::default());
        (
            ContainerCreateHandler::new(sessions.clone()),
            ContainerDestroyHandler::new(sessions),
            provider,
        )
    }

    fn job(job_type: JobType, session_id: &str) -> Job {
        let new_job = NewJob::new(
            job_type,
            serde_json::json!({"sessionId": session_id, "workspacePath": "/tmp/ws"}),
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
    async fn create_then_destroy_round_trip() {
        let (create, destroy, provider) = handler_fixture().await;
        create
            .handle(&job(JobType::ContainerCreate, "sess-1"))
            .await
            .unwrap();
        assert_eq!(
            provider.get("sess-1").await.unwrap().status,
            SandboxStatus::Running
        );
        // Re-running create is a no-op.
        create
            .handle(&job(JobType::ContainerCreate, "sess-1"))
            .await
            .unwrap();

        destroy
            .handle(&job(JobType::ContainerDestroy, "sess-1"))
            .await
            .unwrap();
        assert!(provider.get("sess-1").await.is_err());
        // Destroy of an unknown sandbox still succeeds.
        destroy
            .handle(&job(JobType::ContainerDestroy, "sess-1"))
            .await
            .unwrap();
    }
}
