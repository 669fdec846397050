//! Project event log. `seq` comes from a single-row counter bumped inside
//! the insert transaction, so it is strictly increasing across the whole
//! database on both backends.

use sqlx::any::AnyRow;

use crate::error::Result;
use crate::model::ProjectEvent;
use crate::store::{Store, get_i64, get_json, get_string};
use crate::{id, now_ms};

fn event_from_row(row: &AnyRow) -> Result<ProjectEvent> {
    Ok(ProjectEvent {
        id: get_string(row, "id")?,
        seq: get_i64(row, "seq")?,
        project_id: get_string(row, "project_id")?,
        event_type: get_string(row, "event_type")?,
        data: get_json(row, "data")?,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn create_project_event(
        &self,
        project_id: &str,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<ProjectEvent> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE event_seq SET value = value + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT value FROM event_seq WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;
        let seq = get_i64(&row, "value")?;

        let event = ProjectEvent {
            id: id::new_id(),
            seq,
            project_id: project_id.to_string(),
            event_type: event_type.to_string(),
            data: data.clone(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO project_events (id, seq, project_id, event_type, data, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&event.id)
        .bind(event.seq)
        .bind(&event.project_id)
        .bind(&event.event_type)
        .bind(event.data.to_string())
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(event)
    }

    /// All events after `seq`, any project. The broker's poller tail.
    pub async fn list_events_after_seq(&self, seq: i64, limit: i64) -> Result<Vec<ProjectEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM project_events WHERE seq > $1 ORDER BY seq LIMIT {limit}"
        ))
        .bind(seq)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// This project's events after a reference event ID (replay cursor).
    pub async fn list_project_events_after_id(
        &self,
        project_id: &str,
        after_id: Option<&str>,
        since: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ProjectEvent>> {
        let after_seq = match after_id {
            Some(event_id) => {
                let row = sqlx::query("SELECT seq FROM project_events WHERE id = $1")
                    .bind(event_id)
                    .fetch_optional(self.pool())
                    .await?;
                match row {
                    Some(row) => get_i64(&row, "seq")?,
                    None => 0,
                }
            }
            None => 0,
        };
        let since = since.unwrap_or(0);
        let rows = sqlx::query(&format!(
            "SELECT * FROM project_events
             WHERE project_id = $1 AND seq > $2 AND created_at >= $3
             ORDER BY seq LIMIT {limit}"
        ))
        .bind(project_id)
        .bind(after_seq)
        .bind(since)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn max_event_seq(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM event_seq WHERE id = 1")
            .fetch_one(self.pool())
            .await?;
        get_i64(&row, "value")
    }

    /// Age-based GC. `seq` values are never reclaimed.
    pub async fn delete_events_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM project_events WHERE created_at < $1")
            .bind(cutoff_ms)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn seq_is_strictly_increasing_across_projects() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store
            .create_project_event("p1", "session_updated", &json!({"n": 1}))
            .await
            .unwrap();
        let b = store
            .create_project_event("p2", "workspace_updated", &json!({"n": 2}))
            .await
            .unwrap();
        let c = store
            .create_project_event("p1", "session_updated", &json!({"n": 3}))
            .await
            .unwrap();
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[tokio::test]
    async fn list_after_seq_tails_everything() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store
            .create_project_event("p1", "session_updated", &json!({}))
            .await
            .unwrap();
        store
            .create_project_event("p2", "session_updated", &json!({}))
            .await
            .unwrap();
        let tail = store.list_events_after_seq(first.seq, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].project_id, "p2");
    }

    #[tokio::test]
    async fn replay_cursor_by_event_id() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store
            .create_project_event("p1", "session_updated", &json!({"n": 1}))
            .await
            .unwrap();
        let second = store
            .create_project_event("p1", "session_updated", &json!({"n": 2}))
            .await
            .unwrap();
        let replay = store
            .list_project_events_after_id("p1", Some(&first.id), None, 100)
            .await
            .unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, second.id);
        // Unknown cursor replays from the beginning.
        let replay = store
            .list_project_events_after_id("p1", Some("missing"), None, 100)
            .await
            .unwrap();
        assert_eq!(replay.len(), 2);
    }

    #[tokio::test]
    async fn gc_deletes_by_age_only() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_project_event("p1", "session_updated", &json!({}))
            .await
            .unwrap();
        assert_eq!(store.delete_events_older_than(0).await.unwrap(), 0);
        let future = crate::now_ms() + 1000;
        assert_eq!(store.delete_events_older_than(future).await.unwrap(), 1);
        // The counter is untouched by GC.
        assert!(store.max_event_seq().await.unwrap() >= 1);
    }
}
