//! Agents, their MCP servers, and project credentials.

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::model::{Agent, AuthType, Credential, McpServer, McpTransport};
use crate::store::{Store, get_i64, get_json, get_opt_string, get_string, parse_enum};
use crate::{id, now_ms};

fn agent_from_row(row: &AnyRow) -> Result<Agent> {
    Ok(Agent {
        id: get_string(row, "id")?,
        project_id: get_string(row, "project_id")?,
        name: get_string(row, "name")?,
        agent_type: get_string(row, "agent_type")?,
        system_prompt: get_opt_string(row, "system_prompt")?,
        is_default: get_i64(row, "is_default")? != 0,
        created_at: get_i64(row, "created_at")?,
    })
}

fn credential_from_row(row: &AnyRow) -> Result<Credential> {
    Ok(Credential {
        id: get_string(row, "id")?,
        project_id: get_string(row, "project_id")?,
        provider: get_string(row, "provider")?,
        auth_type: parse_enum(&get_string(row, "auth_type")?, AuthType::parse, "auth type")?,
        secret: get_string(row, "secret")?,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn create_agent(
        &self,
        project_id: &str,
        name: &str,
        agent_type: &str,
        system_prompt: Option<&str>,
    ) -> Result<Agent> {
        let agent = Agent {
            id: id::new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            agent_type: agent_type.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            is_default: false,
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO agents (id, project_id, name, agent_type, system_prompt, is_default, created_at)
             VALUES ($1, $2, $3, $4, $5, 0, $6)",
        )
        .bind(&agent.id)
        .bind(&agent.project_id)
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(&agent.system_prompt)
        .bind(agent.created_at)
        .execute(self.pool())
        .await?;
        Ok(agent)
    }

    pub async fn get_agent(&self, id: &str) -> Result<Agent> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent '{id}'")))?;
        agent_from_row(&row)
    }

    pub async fn list_agents(&self, project_id: &str) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM mcp_servers WHERE agent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Clears every default flag in the project, then sets the chosen one in
    /// the same transaction, so at most one default survives.
    pub async fn set_default_agent(&self, project_id: &str, agent_id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE agents SET is_default = 0 WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        let updated =
            sqlx::query("UPDATE agents SET is_default = 1 WHERE id = $1 AND project_id = $2")
                .bind(agent_id)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("agent '{agent_id}'")));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_default_agent(&self, project_id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT * FROM agents WHERE project_id = $1 AND is_default = 1",
        )
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    // -- MCP servers --------------------------------------------------------

    pub async fn add_mcp_server(
        &self,
        agent_id: &str,
        name: &str,
        transport: McpTransport,
        config: &serde_json::Value,
    ) -> Result<McpServer> {
        let server = McpServer {
            id: id::new_id(),
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            transport,
            config: config.clone(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO mcp_servers (id, agent_id, name, transport, config, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&server.id)
        .bind(&server.agent_id)
        .bind(&server.name)
        .bind(server.transport.as_str())
        .bind(server.config.to_string())
        .bind(server.created_at)
        .execute(self.pool())
        .await?;
        Ok(server)
    }

    pub async fn list_mcp_servers(&self, agent_id: &str) -> Result<Vec<McpServer>> {
        let rows = sqlx::query(
            "SELECT * FROM mcp_servers WHERE agent_id = $1 ORDER BY created_at",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(McpServer {
                    id: get_string(row, "id")?,
                    agent_id: get_string(row, "agent_id")?,
                    name: get_string(row, "name")?,
                    transport: parse_enum(
                        &get_string(row, "transport")?,
                        McpTransport::parse,
                        "mcp transport",
                    )?,
                    config: get_json(row, "config")?,
                    created_at: get_i64(row, "created_at")?,
                })
            })
            .collect()
    }

    pub async fn delete_mcp_server(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM mcp_servers WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // -- credentials --------------------------------------------------------

    /// `secret` must already be sealed by the caller (see `crypto`).
    pub async fn create_credential(
        &self,
        project_id: &str,
        provider: &str,
        auth_type: AuthType,
        sealed_secret: &str,
    ) -> Result<Credential> {
        let credential = Credential {
            id: id::new_id(),
            project_id: project_id.to_string(),
            provider: provider.to_string(),
            auth_type,
            secret: sealed_secret.to_string(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO credentials (id, project_id, provider, auth_type, secret, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&credential.id)
        .bind(&credential.project_id)
        .bind(&credential.provider)
        .bind(credential.auth_type.as_str())
        .bind(&credential.secret)
        .bind(credential.created_at)
        .execute(self.pool())
        .await?;
        Ok(credential)
    }

    pub async fn list_credentials(&self, project_id: &str) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            "SELECT * FROM credentials WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(credential_from_row).collect()
    }

    pub async fn delete_credential(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn project(store: &Store) -> String {
        let user = store.ensure_user("github", "1", "a").await.unwrap();
        store.create_project("p", "P", &user.id).await.unwrap().id
    }

    #[tokio::test]
    async fn default_agent_swap_keeps_at_most_one() {
        let store = Store::open_in_memory().await.unwrap();
        let project = project(&store).await;
        let a = store.create_agent(&project, "a", "claude", None).await.unwrap();
        let b = store.create_agent(&project, "b", "claude", None).await.unwrap();

        store.set_default_agent(&project, &a.id).await.unwrap();
        store.set_default_agent(&project, &b.id).await.unwrap();

        let defaults: Vec<_> = store
            .list_agents(&project)
            .await
            .unwrap()
            .into_iter()
            .filter(|agent| agent.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b.id);
    }

    #[tokio::test]
    async fn set_default_rejects_foreign_agent() {
        let store = Store::open_in_memory().await.unwrap();
        let project = project(&store).await;
        let err = store
            .set_default_agent(&project, "nope")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn mcp_servers_attach_to_agents() {
        let store = Store::open_in_memory().await.unwrap();
        let project = project(&store).await;
        let agent = store.create_agent(&project, "a", "claude", None).await.unwrap();
        store
            .add_mcp_server(
                &agent.id,
                "files",
                McpTransport::Stdio,
                &serde_json::json!({"command": "mcp-files"}),
            )
            .await
            .unwrap();
        let servers = store.list_mcp_servers(&agent.id).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].transport, McpTransport::Stdio);
    }
}
