use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::{ApiError, ApiResult, AppState, require_member};
use crate::error::Error;
use crate::model::{Agent, McpServer, McpTransport};

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(rename = "agentType")]
    pub agent_type: String,
    #[serde(rename = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddMcpServerRequest {
    pub name: String,
    pub transport: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{pid}/agents", get(list_agents).post(create_agent))
        .route(
            "/projects/{pid}/agents/{aid}",
            get(get_agent).delete(delete_agent),
        )
        .route("/projects/{pid}/agents/{aid}/default", post(set_default))
        .route(
            "/projects/{pid}/agents/{aid}/mcp-servers",
            get(list_mcp).post(add_mcp),
        )
        .route(
            "/projects/{pid}/agents/{aid}/mcp-servers/{mid}",
            axum::routing::delete(delete_mcp),
        )
}

async fn project_agent(
    state: &AppState,
    project_id: &str,
    agent_id: &str,
) -> Result<Agent, ApiError> {
    let agent = state.store.get_agent(agent_id).await?;
    if agent.project_id != project_id {
        return Err(Error::NotFound(format!("agent '{agent_id}'")).into());
    }
    Ok(agent)
}

async fn list_agents(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
) -> ApiResult<Json<Vec<Agent>>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(state.store.list_agents(&project.id).await?))
}

async fn create_agent(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(pid): Path<String>,
    Json(body): Json<CreateAgentRequest>,
) -> ApiResult<Json<Agent>> {
    let project = require_member(&state, &pid, &user).await?;
    if body.agent_type.trim().is_empty() {
        return Err(Error::InvalidRequest("agentType must not be empty".into()).into());
    }
    let agent = state
        .store
        .create_agent(
            &project.id,
            &body.name,
            &body.agent_type,
            body.system_prompt.as_deref(),
        )
        .await?;
    if body.is_default {
        state.store.set_default_agent(&project.id, &agent.id).await?;
    }
    Ok(Json(state.store.get_agent(&agent.id).await?))
}

async fn get_agent(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid)): Path<(String, String)>,
) -> ApiResult<Json<Agent>> {
    let project = require_member(&state, &pid, &user).await?;
    Ok(Json(project_agent(&state, &project.id, &aid).await?))
}

async fn delete_agent(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let agent = project_agent(&state, &project.id, &aid).await?;
    state.store.delete_agent(&agent.id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn set_default(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid)): Path<(String, String)>,
) -> ApiResult<Json<Agent>> {
    let project = require_member(&state, &pid, &user).await?;
    let agent = project_agent(&state, &project.id, &aid).await?;
    state.store.set_default_agent(&project.id, &agent.id).await?;
    Ok(Json(state.store.get_agent(&agent.id).await?))
}

async fn list_mcp(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid)): Path<(String, String)>,
) -> ApiResult<Json<Vec<McpServer>>> {
    let project = require_member(&state, &pid, &user).await?;
    let agent = project_agent(&state, &project.id, &aid).await?;
    Ok(Json(state.store.list_mcp_servers(&agent.id).await?))
}

async fn add_mcp(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid)): Path<(String, String)>,
    Json(body): Json<AddMcpServerRequest>,
) -> ApiResult<Json<McpServer>> {
    let project = require_member(&state, &pid, &user).await?;
    let agent = project_agent(&state, &project.id, &aid).await?;
    let transport = McpTransport::parse(&body.transport)
        .ok_or_else(|| Error::InvalidRequest("transport must be 'stdio' or 'http'".into()))?;
    let server = state
        .store
        .add_mcp_server(&agent.id, &body.name, transport, &body.config)
        .await?;
    Ok(Json(server))
}

async fn delete_mcp(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((pid, aid, mid)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = require_member(&state, &pid, &user).await?;
    let agent = project_agent(&state, &project.id, &aid).await?;
    let servers = state.store.list_mcp_servers(&agent.id).await?;
    if !servers.iter().any(|s| s.id == mid) {
        return Err(Error::NotFound(format!("mcp server '{mid}'")).into());
    }
    state.store.delete_mcp_server(&mid).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
