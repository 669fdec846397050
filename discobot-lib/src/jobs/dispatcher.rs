//! Single-leader job dispatcher.
//!
//! Every process runs the leadership loop; only the current leaseholder
//! claims and executes jobs. A bounded worker pool limits total concurrency
//! and per-type caps keep container churn in check.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::EventBroker;
use crate::jobs::JobHandler;
use crate::model::{EVENT_STARTUP_TASK_UPDATED, Job, JobType};
use crate::store::Store;

/// Stale-job sweep cadence once leading.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    store: Store,
    broker: Arc<EventBroker>,
    server_id: String,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    pool: Arc<Semaphore>,
    type_limits: HashMap<JobType, Arc<Semaphore>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    poll_interval: Duration,
    stale_after: Duration,
    retry_backoff: Duration,
    is_leader: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        broker: Arc<EventBroker>,
        config: &Config,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> Arc<Self> {
        let server_id = config
            .leader_id
            .clone()
            .unwrap_or_else(crate::id::new_id);
        let mut type_limits = HashMap::new();
        type_limits.insert(
            JobType::ContainerCreate,
            Arc::new(Semaphore::new(config.container_create_concurrency)),
        );
        type_limits.insert(
            JobType::ContainerDestroy,
            Arc::new(Semaphore::new(config.container_destroy_concurrency)),
        );
        Arc::new(Self {
            store,
            broker,
            server_id,
            handlers: handlers
                .into_iter()
                .map(|h| (h.job_type(), h))
                .collect(),
            pool: Arc::new(Semaphore::new(config.job_worker_pool)),
            type_limits,
            heartbeat_interval: config.leader_heartbeat_interval,
            heartbeat_timeout: config.job_heartbeat_timeout,
            poll_interval: config.poll_interval,
            stale_after: config.job_stale_after,
            retry_backoff: config.job_retry_backoff,
            is_leader: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Leadership + work loop. Runs until shutdown; followers idle in the
    /// heartbeat cycle, the leader also polls the queue.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut last_heartbeat: Option<tokio::time::Instant> = None;
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let heartbeat_due = last_heartbeat
                .map(|t| t.elapsed() >= self.heartbeat_interval)
                .unwrap_or(true);
            if heartbeat_due {
                match self
                    .store
                    .try_acquire_leadership(&self.server_id, self.heartbeat_timeout)
                    .await
                {
                    Ok(leading) => {
                        let was = self.is_leader.swap(leading, Ordering::SeqCst);
                        if leading && !was {
                            tracing::info!(server_id = %self.server_id, "acquired dispatcher leadership");
                        } else if !leading && was {
                            tracing::warn!(server_id = %self.server_id, "lost dispatcher leadership");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "leadership heartbeat failed");
                        self.is_leader.store(false, Ordering::SeqCst);
                    }
                }
                last_heartbeat = Some(tokio::time::Instant::now());
            }

            if self.is_leader() {
                if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                    match self.store.cleanup_stale_jobs(self.stale_after).await {
                        Ok(0) => {}
                        Ok(n) => tracing::warn!(requeued = n, "requeued stale jobs"),
                        Err(err) => tracing::warn!(error = %err, "stale job cleanup failed"),
                    }
                    last_cleanup = tokio::time::Instant::now();
                }
                // Drain everything claimable before sleeping.
                while self.dispatch_one().await {
                    if shutdown.is_cancelled() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        if self.is_leader() {
            if let Err(err) = self.store.release_leadership(&self.server_id).await {
                tracing::warn!(error = %err, "failed to release leadership");
            }
        }
    }

    /// Claim at most one job (respecting pool and per-type caps) and spawn
    /// its handler. Returns whether anything was dispatched.
    async fn dispatch_one(self: &Arc<Self>) -> bool {
        for (job_type, handler) in &self.handlers {
            let type_permit = match self.type_limits.get(job_type) {
                Some(limit) => match limit.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => continue,
                },
                None => None,
            };
            let Ok(pool_permit) = self.pool.clone().try_acquire_owned() else {
                return false;
            };

            let claimed = match self
                .store
                .claim_job_of_types(&[*job_type], &self.server_id)
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(error = %err, job_type = job_type.as_str(), "claim failed");
                    None
                }
            };
            let Some(job) = claimed else {
                continue;
            };

            let dispatcher = Arc::clone(self);
            let handler = handler.clone();
            tokio::spawn(async move {
                let _pool_permit = pool_permit;
                let _type_permit = type_permit;
                dispatcher.execute(handler, job).await;
            });
            return true;
        }
        false
    }

    async fn execute(&self, handler: Arc<dyn JobHandler>, job: Job) {
        tracing::info!(job_id = %job.id, job_type = job.job_type.as_str(), attempt = job.attempts, "job started");
        self.emit_task_event(&job, "running").await;

        match handler.handle(&job).await {
            Ok(()) => {
                if let Err(err) = self.store.complete_job(&job.id).await {
                    tracing::error!(job_id = %job.id, error = %err, "failed to mark job completed");
                }
                tracing::info!(job_id = %job.id, "job completed");
                self.emit_task_event(&job, "completed").await;
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(job_id = %job.id, error = %message, "job failed");
                match self
                    .store
                    .fail_job(&job.id, &message, self.retry_backoff)
                    .await
                {
                    Ok(updated) => {
                        self.emit_task_event(&updated, updated.status.as_str()).await;
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "failed to record job failure");
                    }
                }
            }
        }
    }

    /// Surface dispatcher activity to the owning project's UI feed.
    async fn emit_task_event(&self, job: &Job, state: &str) {
        let Some(project_id) = job.payload.get("projectId").and_then(|v| v.as_str()) else {
            return;
        };
        let _ = self
            .broker
            .publish(
                project_id,
                EVENT_STARTUP_TASK_UPDATED,
                &json!({
                    "task": {
                        "id": job.id,
                        "type": job.job_type,
                        "state": state,
                        "attempts": job.attempts,
                        "error": job.error,
                    }
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::NewJob;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct CountingHandler {
        job_type: JobType,
        runs: Arc<AtomicU64>,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn job_type(&self) -> JobType {
            self.job_type
        }

        async fn handle(&self, job: &Job) -> crate::error::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && run == 0 {
                return Err(Error::BackendUnavailable("induced failure".into()));
            }
            let _ = job;
            Ok(())
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.poll_interval = Duration::from_millis(20);
        config.leader_heartbeat_interval = Duration::from_millis(50);
        config.job_retry_backoff = Duration::ZERO;
        config
    }

    async fn broker(store: &Store) -> Arc<EventBroker> {
        EventBroker::new(
            store.clone(),
            128,
            Duration::from_millis(25),
            Duration::from_secs(3600),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn leader_processes_jobs_to_completion() {
        let store = Store::open_in_memory().await.unwrap();
        let runs = Arc::new(AtomicU64::new(0));
        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            job_type: JobType::WorkspaceInit,
            runs: runs.clone(),
            fail_first: false,
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            broker(&store).await,
            &fast_config(),
            vec![handler],
        );

        let job = store
            .enqueue_job(NewJob::new(JobType::WorkspaceInit, serde_json::json!({})))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, crate::model::JobStatus::Completed);
        // Graceful shutdown released the lease.
        assert!(store.current_leader().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_is_retried_until_success() {
        let store = Store::open_in_memory().await.unwrap();
        let runs = Arc::new(AtomicU64::new(0));
        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            job_type: JobType::WorkspaceInit,
            runs: runs.clone(),
            fail_first: true,
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            broker(&store).await,
            &fast_config(),
            vec![handler],
        );

        let job = store
            .enqueue_job(NewJob::new(JobType::WorkspaceInit, serde_json::json!({})))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
        for _ in 0..200 {
            let current = store.get_job(&job.id).await.unwrap();
            if current.status == crate::model::JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, crate::model::JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn follower_does_not_claim() {
        let store = Store::open_in_memory().await.unwrap();
        // Another process holds a fresh lease.
        assert!(store
            .try_acquire_leadership("incumbent", Duration::from_secs(30))
            .await
            .unwrap());

        let runs = Arc::new(AtomicU64::new(0));
        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            job_type: JobType::WorkspaceInit,
            runs: runs.clone(),
            fail_first: false,
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            broker(&store).await,
            &fast_config(),
            vec![handler],
        );
        store
            .enqueue_job(NewJob::new(JobType::WorkspaceInit, serde_json::json!({})))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(!dispatcher.is_leader());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
