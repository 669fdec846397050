//! `session_init`: drives a session through the state machine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::{JobHandler, payload_str};
use crate::model::{Job, JobType};
use crate::session::SessionService;

pub struct SessionInitHandler {
    sessions: Arc<SessionService>,
}

impl SessionInitHandler {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl JobHandler for SessionInitHandler {
    fn job_type(&self) -> JobType {
        JobType::SessionInit
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let session_id = payload_str(job, "sessionId")?;
        self.sessions.run_init(&session_id).await
    }
}
