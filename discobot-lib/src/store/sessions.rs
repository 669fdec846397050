//! Sessions, messages, and terminal history.

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::message::Part;
use crate::model::{
    CommitStatus, Message, MessageRole, Session, SessionStatus, TerminalRecord,
};
use crate::store::{Store, get_i64, get_opt_string, get_string, parse_enum};
use crate::{id, now_ms};

pub(crate) fn session_from_row(row: &AnyRow) -> Result<Session> {
    Ok(Session {
        id: get_string(row, "id")?,
        project_id: get_string(row, "project_id")?,
        workspace_id: get_string(row, "workspace_id")?,
        agent_id: get_opt_string(row, "agent_id")?,
        name: get_string(row, "name")?,
        description: get_opt_string(row, "description")?,
        status: parse_enum(
            &get_string(row, "status")?,
            SessionStatus::parse,
            "session status",
        )?,
        error_message: get_opt_string(row, "error_message")?,
        commit_status: parse_enum(
            &get_string(row, "commit_status")?,
            CommitStatus::parse,
            "commit status",
        )?,
        created_at: get_i64(row, "created_at")?,
        updated_at: get_i64(row, "updated_at")?,
    })
}

fn message_from_row(row: &AnyRow) -> Result<Message> {
    let parts_text = get_string(row, "parts")?;
    let parts: Vec<Part> = serde_json::from_str(&parts_text)?;
    Ok(Message {
        id: get_string(row, "id")?,
        session_id: get_string(row, "session_id")?,
        role: parse_enum(&get_string(row, "role")?, MessageRole::parse, "message role")?,
        parts,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    /// New sessions start `initializing` with `commit_status = none`.
    /// The session's workspace must belong to the same project.
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

    /// Variant that adopts a caller-chosen ID (the chat surface lets the UI
    /// pick the session ID it will stream against).
    pub async fn create_session_with_id(
        &self,
        desired_id: Option<&str>,
        project_id: &str,
        workspace_id: &str,
        agent_id: Option<&str>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Session> {
        let workspace = self.get_workspace(workspace_id).await?;
        if workspace.project_id != project_id {
            return Err(Error::InvalidRequest(
                "workspace belongs to a different project".into(),
            ));
        }
        let now = now_ms();
        let session = Session {
            id: match desired_id {
                Some(value) if id::is_valid_id(value) => value.to_string(),
                _ => id::new_id(),
            },
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            name: name.to_string(),
            description: description.map(str::to_string),
            status: SessionStatus::Initializing,
            error_message: None,
            commit_status: CommitStatus::None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO sessions
                 (id, project_id, workspace_id, agent_id, name, description,
                  status, error_message, commit_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.workspace_id)
        .bind(&session.agent_id)
        .bind(&session.name)
        .bind(&session.description)
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .bind(session.commit_status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(self.pool())
        .await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("session '{id}'")))?;
        session_from_row(&row)
    }

    pub async fn list_sessions(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
        include_closed: bool,
    ) -> Result<Vec<Session>> {
        let mut sql = String::from("SELECT * FROM sessions WHERE project_id = $1");
        if workspace_id.is_some() {
            sql.push_str(" AND workspace_id = $2");
        }
        if !include_closed {
            sql.push_str(" AND status != 'closed'");
        }
        sql.push_str(" ORDER BY created_at");
        let mut query = sqlx::query(&sql).bind(project_id);
        if let Some(ws) = workspace_id {
            query = query.bind(ws);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_session_commit_status(&self, id: &str, status: CommitStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET commit_status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Removes the session and its dependents in one transaction.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM terminal_history WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // -- messages -----------------------------------------------------------

    /// Messages are immutable once written; ordering is insertion order.
    pub async fn create_message(
        &self,
        session_id: &str,
        role: MessageRole,
        parts: &[Part],
    ) -> Result<Message> {
        let message = Message {
            id: id::new_id(),
            session_id: session_id.to_string(),
            role,
            parts: parts.to_vec(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, parts, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(serde_json::to_string(&message.parts)?)
        .bind(message.created_at)
        .execute(self.pool())
        .await?;
        Ok(message)
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    // -- terminal history ---------------------------------------------------

    pub async fn append_terminal_record(
        &self,
        session_id: &str,
        kind: &str,
        data: &str,
    ) -> Result<TerminalRecord> {
        let record = TerminalRecord {
            id: id::new_id(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            data: data.to_string(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO terminal_history (id, session_id, kind, data, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.kind)
        .bind(&record.data)
        .bind(record.created_at)
        .execute(self.pool())
        .await?;
        Ok(record)
    }

    pub async fn list_terminal_history(&self, session_id: &str) -> Result<Vec<TerminalRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM terminal_history WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TerminalRecord {
                    id: get_string(row, "id")?,
                    session_id: get_string(row, "session_id")?,
                    kind: get_string(row, "kind")?,
                    data: get_string(row, "data")?,
                    created_at: get_i64(row, "created_at")?,
                })
            })
            .collect()
    }
}
