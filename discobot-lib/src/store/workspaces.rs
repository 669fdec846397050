//! Workspaces: project-scoped working trees.

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::model::{Workspace, WorkspaceSource, WorkspaceStatus};
use crate::store::{Store, get_i64, get_opt_string, get_string, parse_enum};
use crate::{id, now_ms};

pub(crate) fn workspace_from_row(row: &AnyRow) -> Result<Workspace> {
    Ok(Workspace {
        id: get_string(row, "id")?,
        project_id: get_string(row, "project_id")?,
        name: get_string(row, "name")?,
        path: get_string(row, "path")?,
        source_type: parse_enum(
            &get_string(row, "source_type")?,
            WorkspaceSource::parse,
            "workspace source",
        )?,
        source_url: get_opt_string(row, "source_url")?,
        status: parse_enum(
            &get_string(row, "status")?,
            WorkspaceStatus::parse,
            "workspace status",
        )?,
        commit: get_opt_string(row, "commit_sha")?,
        error_message: get_opt_string(row, "error_message")?,
        created_at: get_i64(row, "created_at")?,
        updated_at: get_i64(row, "updated_at")?,
    })
}

impl Store {
    /// Workspaces are born `initializing`; a workspace_init job drives them
    /// to `ready` or `error`.
    pub async fn create_workspace(
        &self,
        project_id: &str,
        name: &str,
        path: &str,
        source_type: WorkspaceSource,
        source_url: Option<&str>,
    ) -> Result<Workspace> {
        let now = now_ms();
        let workspace = Workspace {
            id: id::new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            source_type,
            source_url: source_url.map(str::to_string),
            status: WorkspaceStatus::Initializing,
            commit: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO workspaces
                 (id, project_id, name, path, source_type, source_url, status,
                  commit_sha, error_message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&workspace.id)
        .bind(&workspace.project_id)
        .bind(&workspace.name)
        .bind(&workspace.path)
        .bind(workspace.source_type.as_str())
        .bind(&workspace.source_url)
        .bind(workspace.status.as_str())
        .bind(&workspace.commit)
        .bind(&workspace.error_message)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(self.pool())
        .await?;
        Ok(workspace)
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace '{id}'")))?;
        workspace_from_row(&row)
    }

    pub async fn list_workspaces(&self, project_id: &str) -> Result<Vec<Workspace>> {
        let rows = sqlx::query(
            "SELECT * FROM workspaces WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(workspace_from_row).collect()
    }

    pub async fn update_workspace_status(
        &self,
        id: &str,
        status: WorkspaceStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workspaces SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_workspace_commit(&self, id: &str, commit: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET commit_sha = $1, updated_at = $2 WHERE id = $3")
            .bind(commit)
            .bind(now_ms())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Count of sessions still holding this workspace (anything not closed).
    pub async fn count_open_sessions_for_workspace(&self, workspace_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sessions WHERE workspace_id = $1 AND status != 'closed'",
        )
        .bind(workspace_id)
        .fetch_one(self.pool())
        .await?;
        get_i64(&row, "n")
    }

    /// Removes messages and terminal history for all of the workspace's
    /// sessions, the sessions, then the workspace, all in one transaction.
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE session_id IN
                 (SELECT id FROM sessions WHERE workspace_id = $1)",
        )
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM terminal_history WHERE session_id IN
                 (SELECT id FROM sessions WHERE workspace_id = $1)",
        )
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE workspace_id = $1")
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn workspace_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        let ws = store
            .create_workspace(&project.id, "main", "/tmp/ws", WorkspaceSource::Git, Some("https://example.test/repo.git"))
            .await
            .unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Initializing);

        store
            .update_workspace_status(&ws.id, WorkspaceStatus::Ready, None)
            .await
            .unwrap();
        store.set_workspace_commit(&ws.id, "abc123").await.unwrap();
        let ws = store.get_workspace(&ws.id).await.unwrap();
        assert_eq!(ws.status, WorkspaceStatus::Ready);
        assert_eq!(ws.commit.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn delete_workspace_cascades_sessions() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        let ws = store
            .create_workspace(&project.id, "main", "/tmp/ws", WorkspaceSource::Local, None)
            .await
            .unwrap();
        let session = store
            .create_session(&project.id, &ws.id, None, "s", None)
            .await
            .unwrap();
        assert_eq!(
            store.count_open_sessions_for_workspace(&ws.id).await.unwrap(),
            1
        );

        store.delete_workspace(&ws.id).await.unwrap();
        assert!(store.get_workspace(&ws.id).await.is_err());
        assert!(store.get_session(&session.id).await.is_err());
    }
}
