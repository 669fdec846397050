//! Projects and membership. A project is the tenant boundary: deleting one
//! removes every scoped entity in a single transaction.

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::model::{MemberRole, Project, ProjectMember};
use crate::store::{Store, get_i64, get_string, parse_enum};
use crate::{id, now_ms};

fn project_from_row(row: &AnyRow) -> Result<Project> {
    Ok(Project {
        id: get_string(row, "id")?,
        slug: get_string(row, "slug")?,
        name: get_string(row, "name")?,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn create_project(&self, slug: &str, name: &str, owner_id: &str) -> Result<Project> {
        let project = Project {
            id: id::new_id(),
            slug: slug.to_string(),
            name: name.to_string(),
            created_at: now_ms(),
        };
        let mut tx = self.pool().begin().await?;
        sqlx::query("INSERT INTO projects (id, slug, name, created_at) VALUES ($1, $2, $3, $4)")
            .bind(&project.id)
            .bind(&project.slug)
            .bind(&project.name)
            .bind(project.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)")
            .bind(&project.id)
            .bind(owner_id)
            .bind(MemberRole::Owner.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("project '{id}'")))?;
        project_from_row(&row)
    }

    pub async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE slug = $1")
            .bind(slug)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn list_projects_for_user(&self, user_id: &str) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT p.* FROM projects p
             JOIN project_members m ON m.project_id = p.id
             WHERE m.user_id = $1
             ORDER BY p.created_at",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    /// Tenant teardown: messages, terminal history, sessions, workspaces,
    /// MCP servers, agents, invitations, credentials, members, project row,
    /// all in one transaction.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE session_id IN
                 (SELECT id FROM sessions WHERE project_id = $1)",
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM terminal_history WHERE session_id IN
                 (SELECT id FROM sessions WHERE project_id = $1)",
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workspaces WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM mcp_servers WHERE agent_id IN
                 (SELECT id FROM agents WHERE project_id = $1)",
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM agents WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM invitations WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM credentials WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM project_members WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_project_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)",
        )
        .bind(project_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Membership row, if any. Authorization for every project-scoped route.
    pub async fn get_project_member(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Option<ProjectMember>> {
        let row = sqlx::query(
            "SELECT * FROM project_members WHERE project_id = $1 AND user_id = $2",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(ProjectMember {
            project_id: get_string(&row, "project_id")?,
            user_id: get_string(&row, "user_id")?,
            role: parse_enum(&get_string(&row, "role")?, MemberRole::parse, "member role")?,
        }))
    }
}
