//! `session_commit`: archive a running session.
//!
//! The commit is a chat turn: the handler sends `/discobot-commit
//! <baseCommit>` into the agent, waits for the completion to reach a
//! terminal chunk, then marks the session `closed` and schedules sandbox
//! teardown. The wait is bounded by `commit_timeout`; on expiry the job
//! fails and retries like any other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::completion::CompletionService;
use crate::error::{Error, Result};
use crate::jobs::{JobHandler, payload_str};
use crate::message::Part;
use crate::model::{CommitStatus, Job, JobType, NewJob, SessionStatus};
use crate::session::SessionService;

pub struct SessionCommitHandler {
    sessions: Arc<SessionService>,
    completions: Arc<CompletionService>,
    commit_timeout: Duration,
}

impl SessionCommitHandler {
    pub fn new(
        sessions: Arc<SessionService>,
        completions: Arc<CompletionService>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            completions,
            commit_timeout,
        }
    }

    /// Block until the commit turn's completion slot is released and its
    /// buffer ends in a terminal chunk.
    async fn wait_for_terminal(&self, session_id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.commit_timeout;
        loop {
            let (running, _) = self.completions.status(session_id);
            if !running {
                let attached = self.completions.attach(session_id);
                if attached
                    .replay
                    .last()
                    .map(|chunk| chunk.is_terminal())
                    .unwrap_or(false)
                {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(
                    "commit turn produced no terminal chunk".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl JobHandler for SessionCommitHandler {
    fn job_type(&self) -> JobType {
        JobType::SessionCommit
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let session_id = payload_str(job, "sessionId")?;
        let store = self.sessions.store();
        let session = store.get_session(&session_id).await?;
        if session.status == SessionStatus::Closed {
            return Ok(());
        }
        if session.status != SessionStatus::Running {
            return Err(Error::conflict("session_not_running"));
        }

        let base_commit = job
            .payload
            .get("baseCommit")
            .and_then(|v| v.as_str())
            .unwrap_or("HEAD")
            .to_string();
        let text = format!("/discobot-commit {base_commit}");
        let payload = json!({
            "id": session_id,
            "messages": [{
                "id": crate::id::new_id(),
                "role": "user",
                "parts": [{"type": "text", "text": text}],
            }],
        });

        // A user-driven completion in flight blocks the commit turn; retry.
        self.completions
            .start(&session_id, vec![Part::text(text)], payload)
            .await?;
        self.wait_for_terminal(&session_id).await?;

        store
            .set_session_commit_status(&session_id, CommitStatus::Completed)
            .await?;
        self.sessions
            .transition(&session_id, SessionStatus::Closed, None)
            .await?;
        store
            .enqueue_job(
                NewJob::new(
                    JobType::ContainerDestroy,
                    json!({
                        "sessionId": session_id,
                        "projectId": session.project_id,
                    }),
                )
                .resource("sandbox", &session_id),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBroker;
    use crate::model::{JobStatus, WorkspaceSource, WorkspaceStatus};
    use crate::store::Store;
    use sandbox_runtime::{CreateOpts, MockProvider, Provider};

    async fn fixture() -> (SessionCommitHandler, Store, String) {
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
        let config = Config::default();
        let sessions = crate::session::SessionService::new(
            store.clone(),
            broker.clone(),
            provider.clone(),
            &config,
        );
        let completions = CompletionService::new(
            store.clone(),
            broker,
            provider.clone(),
            Duration::from_secs(5),
        );

        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        let ws = store
            .create_workspace(&project.id, "main", "/tmp/ws", WorkspaceSource::Local, None)
            .await
            .unwrap();
        store
            .update_workspace_status(&ws.id, WorkspaceStatus::Ready, None)
            .await
            .unwrap();
        let session = store
            .create_session(&project.id, &ws.id, None, "s", None)
            .await
            .unwrap();
        store
            .update_session_status(&session.id, SessionStatus::Running, None)
            .await
            .unwrap();
        provider
            .create(&session.id, &CreateOpts::default())
            .await
            .unwrap();
        provider.start(&session.id).await.unwrap();

        let handler =
            SessionCommitHandler::new(sessions, completions, Duration::from_secs(5));
        (handler, store, session.id)
    }

    fn job_for(session_id: &str) -> Job {
        Job {
            id: "j1".into(),
            job_type: JobType::SessionCommit,
            payload: json!({"sessionId": session_id, "baseCommit": "abc123"}),
            status: JobStatus::Running,
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
    async fn commit_closes_session_and_schedules_teardown() {
        let (handler, store, session_id) = fixture().await;
        handler.handle(&job_for(&session_id)).await.unwrap();

        let session = store.get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(session.commit_status, CommitStatus::Completed);

        // The commit turn was a real chat exchange.
        let messages = store.list_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(Part::collect_text(&messages[0].parts).starts_with("/discobot-commit abc123"));

        // Teardown queued.
        let destroy = store
            .claim_job_of_types(&[JobType::ContainerDestroy], "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(destroy.payload["sessionId"], session_id);
    }

    #[tokio::test]
    async fn commit_on_closed_session_is_noop() {
        let (handler, store, session_id) = fixture().await;
        store
            .update_session_status(&session_id, SessionStatus::Closed, None)
            .await
            .unwrap();
        handler.handle(&job_for(&session_id)).await.unwrap();
        assert!(store.list_messages(&session_id).await.unwrap().is_empty());
    }
}
