//! Background job handlers and the leader-elected dispatcher.

pub mod commit;
pub mod container;
pub mod dispatcher;
pub mod session_init;
pub mod workspace;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{Job, JobType};

pub use commit::SessionCommitHandler;
pub use container::{ContainerCreateHandler, ContainerDestroyHandler};
pub use dispatcher::Dispatcher;
pub use session_init::SessionInitHandler;
pub use workspace::WorkspaceInitHandler;

/// One handler per job type. Handlers must be idempotent: the queue is
/// at-least-once and a crashed worker's job will run again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Required string field from a job payload.
pub(crate) fn payload_str(job: &Job, key: &str) -> Result<String> {
    job.payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "job '{}' payload is missing '{key}'",
                job.id
            ))
        })
}

/// The standard handler set, wired against the shared services.
pub fn default_handlers(
    sessions: std::sync::Arc<crate::session::SessionService>,
    completions: std::sync::Arc<crate::completion::CompletionService>,
    commit_timeout: std::time::Duration,
) -> Vec<std::sync::Arc<dyn JobHandler>> {
    use std::sync::Arc;
    vec![
        Arc::new(SessionInitHandler::new(sessions.clone())) as Arc<dyn JobHandler>,
        Arc::new(WorkspaceInitHandler::new(sessions.clone())),
        Arc::new(ContainerCreateHandler::new(sessions.clone())),
        Arc::new(ContainerDestroyHandler::new(sessions.clone())),
        Arc::new(SessionCommitHandler::new(sessions, completions, commit_timeout)),
    ]
}
