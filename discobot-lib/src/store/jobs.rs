//! Durable job queue and the dispatcher leader lease.
//!
//! Claiming is transactional: candidates are read in priority order and the
//! first one whose resource class has no running job wins. A crashed worker
//! leaves `running` rows behind; `cleanup_stale_jobs` requeues them.

use std::time::Duration;

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::model::{DispatcherLeader, Job, JobStatus, JobType, NewJob};
use crate::store::{Store, get_i64, get_opt_i64, get_opt_string, get_string, parse_enum};
use crate::{id, now_ms};

/// Candidates examined per claim attempt.
const CLAIM_WINDOW: i64 = 10;

fn job_from_row(row: &AnyRow) -> Result<Job> {
    let payload_text = get_string(row, "payload")?;
    Ok(Job {
        id: get_string(row, "id")?,
        job_type: parse_enum(&get_string(row, "job_type")?, JobType::parse, "job type")?,
        payload: serde_json::from_str(&payload_text)?,
        status: parse_enum(&get_string(row, "status")?, JobStatus::parse, "job status")?,
        priority: get_i64(row, "priority")?,
        attempts: get_i64(row, "attempts")?,
        max_attempts: get_i64(row, "max_attempts")?,
        error: get_opt_string(row, "error")?,
        worker_id: get_opt_string(row, "worker_id")?,
        scheduled_at: get_i64(row, "scheduled_at")?,
        started_at: get_opt_i64(row, "started_at")?,
        completed_at: get_opt_i64(row, "completed_at")?,
        resource_type: get_opt_string(row, "resource_type")?,
        resource_id: get_opt_string(row, "resource_id")?,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn enqueue_job(&self, new_job: NewJob) -> Result<Job> {
        let now = now_ms();
        let (resource_type, resource_id) = match &new_job.resource {
            Some((t, i)) => (Some(t.clone()), Some(i.clone())),
            None => (None, None),
        };
        let job = Job {
            id: id::new_id(),
            job_type: new_job.job_type,
            payload: new_job.payload,
            status: JobStatus::Pending,
            priority: new_job.priority,
            attempts: 0,
            max_attempts: new_job.max_attempts,
            error: None,
            worker_id: None,
            scheduled_at: now + new_job.delay_ms,
            started_at: None,
            completed_at: None,
            resource_type,
            resource_id,
            created_at: now,
        };
        sqlx::query(
            "INSERT INTO jobs
                 (id, job_type, payload, status, priority, attempts, max_attempts,
                  error, worker_id, scheduled_at, started_at, completed_at,
                  resource_type, resource_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.payload.to_string())
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.error)
        .bind(&job.worker_id)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.resource_type)
        .bind(&job.resource_id)
        .bind(job.created_at)
        .execute(self.pool())
        .await?;
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("job '{id}'")))?;
        job_from_row(&row)
    }

    /// Atomically claim the next runnable job of one of the given types.
    ///
    /// At most one job per `(resource_type, resource_id)` is running at any
    /// time; jobs without a resource key are claimable unconditionally.
    pub async fn claim_job_of_types(
        &self,
        types: &[JobType],
        worker_id: &str,
    ) -> Result<Option<Job>> {
        if types.is_empty() {
            return Ok(None);
        }
        let now = now_ms();
        // Types come from a closed enum, so inlining them is safe.
        let type_list = types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool().begin().await?;
        let candidates = sqlx::query(&format!(
            "SELECT * FROM jobs
             WHERE status = 'pending' AND scheduled_at <= $1 AND job_type IN ({type_list})
             ORDER BY priority DESC, scheduled_at ASC, created_at ASC
             LIMIT {CLAIM_WINDOW}"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for row in &candidates {
            let candidate = job_from_row(row)?;
            if let (Some(resource_type), Some(resource_id)) =
                (&candidate.resource_type, &candidate.resource_id)
            {
                let running = sqlx::query(
                    "SELECT COUNT(*) AS n FROM jobs
                     WHERE status = 'running' AND resource_type = $1 AND resource_id = $2
                       AND id != $3",
                )
                .bind(resource_type)
                .bind(resource_id)
                .bind(&candidate.id)
                .fetch_one(&mut *tx)
                .await?;
                if get_i64(&running, "n")? > 0 {
                    continue;
                }
            }
            let claimed = sqlx::query(
                "UPDATE jobs
                 SET status = 'running', worker_id = $1, started_at = $2, attempts = attempts + 1
                 WHERE id = $3 AND status = 'pending'",
            )
            .bind(worker_id)
            .bind(now)
            .bind(&candidate.id)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 1 {
                tx.commit().await?;
                let mut job = candidate;
                job.status = JobStatus::Running;
                job.worker_id = Some(worker_id.to_string());
                job.started_at = Some(now);
                job.attempts += 1;
                return Ok(Some(job));
            }
        }
        tx.commit().await?;
        Ok(None)
    }

    pub async fn complete_job(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = $1 WHERE id = $2",
        )
        .bind(now_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Requeue with linear backoff (`attempts × backoff_unit`) until the
    /// attempt budget is spent, then park as `failed`.
    pub async fn fail_job(&self, id: &str, error: &str, backoff_unit: Duration) -> Result<Job> {
        let job = self.get_job(id).await?;
        if job.attempts < job.max_attempts {
            let delay_ms = job.attempts * backoff_unit.as_millis() as i64;
            sqlx::query(
                "UPDATE jobs
                 SET status = 'pending', error = $1, worker_id = NULL, started_at = NULL,
                     scheduled_at = $2
                 WHERE id = $3",
            )
            .bind(error)
            .bind(now_ms() + delay_ms)
            .bind(id)
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'failed', error = $1, completed_at = $2
                 WHERE id = $3",
            )
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .execute(self.pool())
            .await?;
        }
        self.get_job(id).await
    }

    /// Requeue `running` jobs whose worker stopped heartbeating long ago.
    pub async fn cleanup_stale_jobs(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = now_ms() - stale_after.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', worker_id = NULL, started_at = NULL
             WHERE status = 'running' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Pending and running jobs, surfaced by the system status endpoint.
    pub async fn list_active_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('pending', 'running')
             ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    // -- leader lease -------------------------------------------------------

    /// One transaction: insert our row if none, refresh if ours, take over
    /// if the incumbent's heartbeat expired. Returns whether we lead.
    pub async fn try_acquire_leadership(
        &self,
        server_id: &str,
        heartbeat_timeout: Duration,
    ) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT * FROM dispatcher_leader WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?;
        let acquired = match row {
            None => {
                sqlx::query(
                    "INSERT INTO dispatcher_leader (id, server_id, heartbeat_at, acquired_at)
                     VALUES (1, $1, $2, $2)",
                )
                .bind(server_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                true
            }
            Some(row) => {
                let current = get_string(&row, "server_id")?;
                let heartbeat_at = get_i64(&row, "heartbeat_at")?;
                if current == server_id {
                    sqlx::query(
                        "UPDATE dispatcher_leader SET heartbeat_at = $1 WHERE id = 1",
                    )
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    true
                } else if heartbeat_at < now - heartbeat_timeout.as_millis() as i64 {
                    sqlx::query(
                        "UPDATE dispatcher_leader
                         SET server_id = $1, heartbeat_at = $2, acquired_at = $2
                         WHERE id = 1",
                    )
                    .bind(server_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    true
                } else {
                    false
                }
            }
        };
        tx.commit().await?;
        Ok(acquired)
    }

    /// Graceful shutdown: drop the lease so a successor wins immediately.
    pub async fn release_leadership(&self, server_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM dispatcher_leader WHERE id = 1 AND server_id = $1")
            .bind(server_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn current_leader(&self) -> Result<Option<DispatcherLeader>> {
        let row = sqlx::query("SELECT * FROM dispatcher_leader WHERE id = 1")
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(DispatcherLeader {
            server_id: get_string(&row, "server_id")?,
            heartbeat_at: get_i64(&row, "heartbeat_at")?,
            acquired_at: get_i64(&row, "acquired_at")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(job_type: JobType) -> NewJob {
        NewJob::new(job_type, json!({}))
    }

    #[tokio::test]
    async fn claim_respects_priority_then_schedule_order() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_job(job(JobType::SessionInit).priority(0))
            .await
            .unwrap();
        let high = store
            .enqueue_job(job(JobType::SessionInit).priority(10))
            .await
            .unwrap();

        let claimed = store
            .claim_job_of_types(&[JobType::SessionInit], "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn claim_skips_types_not_requested() {
        let store = Store::open_in_memory().await.unwrap();
        store.enqueue_job(job(JobType::SessionCommit)).await.unwrap();
        let claimed = store
            .claim_job_of_types(&[JobType::SessionInit], "w1")
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn resource_class_is_mutually_exclusive() {
        // Same (resource_type, resource_id) never runs twice at once.
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_job(job(JobType::ContainerCreate).resource("session", "s1"))
            .await
            .unwrap();
        store
            .enqueue_job(job(JobType::ContainerCreate).resource("session", "s1"))
            .await
            .unwrap();
        let other = store
            .enqueue_job(job(JobType::ContainerCreate).resource("session", "s2"))
            .await
            .unwrap();

        let first = store
            .claim_job_of_types(&[JobType::ContainerCreate], "w1")
            .await
            .unwrap()
            .unwrap();
        // Second claim must skip the blocked s1 job and take s2.
        let second = store
            .claim_job_of_types(&[JobType::ContainerCreate], "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, other.id);
        // Third claim finds nothing runnable.
        assert!(store
            .claim_job_of_types(&[JobType::ContainerCreate], "w3")
            .await
            .unwrap()
            .is_none());

        // Completing the first unblocks the remaining s1 job.
        store.complete_job(&first.id).await.unwrap();
        let third = store
            .claim_job_of_types(&[JobType::ContainerCreate], "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.resource_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn fail_retries_then_parks_as_failed() {
        // Fail k < max then succeed => completed; fail max times => failed.
        let store = Store::open_in_memory().await.unwrap();
        let queued = store
            .enqueue_job(job(JobType::WorkspaceInit).max_attempts(2))
            .await
            .unwrap();

        let claimed = store
            .claim_job_of_types(&[JobType::WorkspaceInit], "w1")
            .await
            .unwrap()
            .unwrap();
        let failed = store
            .fail_job(&claimed.id, "boom", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let claimed = store
            .claim_job_of_types(&[JobType::WorkspaceInit], "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 2);
        let failed = store
            .fail_job(&claimed.id, "boom again", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom again"));
        assert_eq!(queued.id, failed.id);
    }

    #[tokio::test]
    async fn retry_backoff_delays_reclaim() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_job(job(JobType::WorkspaceInit).max_attempts(3))
            .await
            .unwrap();
        let claimed = store
            .claim_job_of_types(&[JobType::WorkspaceInit], "w1")
            .await
            .unwrap()
            .unwrap();
        store
            .fail_job(&claimed.id, "err", Duration::from_secs(30))
            .await
            .unwrap();
        // scheduled_at is in the future; nothing claimable right now.
        assert!(store
            .claim_job_of_types(&[JobType::WorkspaceInit], "w1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_running_jobs_are_requeued() {
        let store = Store::open_in_memory().await.unwrap();
        store.enqueue_job(job(JobType::SessionInit)).await.unwrap();
        let claimed = store
            .claim_job_of_types(&[JobType::SessionInit], "w1")
            .await
            .unwrap()
            .unwrap();

        // Too fresh to be stale.
        assert_eq!(
            store.cleanup_stale_jobs(Duration::from_secs(300)).await.unwrap(),
            0
        );
        // With a zero threshold everything running is stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            store.cleanup_stale_jobs(Duration::ZERO).await.unwrap(),
            1
        );
        let job = store.get_job(&claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn leadership_single_winner_and_takeover() {
        // Exactly one leader at a time until its heartbeat expires.
        let store = Store::open_in_memory().await.unwrap();
        let timeout = Duration::from_secs(30);

        assert!(store.try_acquire_leadership("a", timeout).await.unwrap());
        assert!(!store.try_acquire_leadership("b", timeout).await.unwrap());
        // Re-acquire by the incumbent refreshes the heartbeat.
        assert!(store.try_acquire_leadership("a", timeout).await.unwrap());

        // Expired incumbent loses to a challenger.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store
            .try_acquire_leadership("b", Duration::ZERO)
            .await
            .unwrap());
        let leader = store.current_leader().await.unwrap().unwrap();
        assert_eq!(leader.server_id, "b");

        // Graceful release opens the door immediately.
        store.release_leadership("b").await.unwrap();
        assert!(store.try_acquire_leadership("c", timeout).await.unwrap());
    }
}
