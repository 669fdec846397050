//! Transactional repository over Postgres or SQLite.
//!
//! One `Store` per process; sqlx's Any driver picks the backend from the
//! URL scheme. Timestamps are millisecond integers, JSON payloads are TEXT,
//! booleans are 0/1 integers, so the schema below runs unchanged on both
//! engines.

mod agents;
mod events;
mod jobs;
mod projects;
mod sessions;
mod users;
mod workspaces;

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::error::Result;

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        UNIQUE (provider, provider_id)
    )",
    "CREATE TABLE IF NOT EXISTS user_sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        token_hash TEXT NOT NULL UNIQUE,
        expires_at BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_prefs (
        user_id TEXT NOT NULL,
        pref_key TEXT NOT NULL,
        pref_value TEXT NOT NULL,
        PRIMARY KEY (user_id, pref_key)
    )",
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS project_members (
        project_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL,
        PRIMARY KEY (project_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS invitations (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        email TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_url TEXT,
        status TEXT NOT NULL,
        commit_sha TEXT,
        error_message TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        agent_id TEXT,
        name TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL,
        error_message TEXT,
        commit_status TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        parts TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, created_at)",
    "CREATE TABLE IF NOT EXISTS terminal_history (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        agent_type TEXT NOT NULL,
        system_prompt TEXT,
        is_default BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mcp_servers (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        name TEXT NOT NULL,
        transport TEXT NOT NULL,
        config TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        auth_type TEXT NOT NULL,
        secret TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        priority BIGINT NOT NULL DEFAULT 0,
        attempts BIGINT NOT NULL DEFAULT 0,
        max_attempts BIGINT NOT NULL DEFAULT 3,
        error TEXT,
        worker_id TEXT,
        scheduled_at BIGINT NOT NULL,
        started_at BIGINT,
        completed_at BIGINT,
        resource_type TEXT,
        resource_id TEXT,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, scheduled_at)",
    "CREATE TABLE IF NOT EXISTS dispatcher_leader (
        id BIGINT PRIMARY KEY,
        server_id TEXT NOT NULL,
        heartbeat_at BIGINT NOT NULL,
        acquired_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS event_seq (
        id BIGINT PRIMARY KEY,
        value BIGINT NOT NULL
    )",
    "INSERT INTO event_seq (id, value)
        SELECT 1, 0 WHERE NOT EXISTS (SELECT 1 FROM event_seq WHERE id = 1)",
    "CREATE TABLE IF NOT EXISTS project_events (
        id TEXT PRIMARY KEY,
        seq BIGINT NOT NULL UNIQUE,
        project_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_project_seq ON project_events (project_id, seq)",
];

impl Store {
    /// Connect and apply the schema. Accepts `postgres://...` and
    /// `sqlite://...` URLs (plus `sqlite::memory:` for tests).
    pub async fn open(db_url: &str) -> Result<Store> {
        sqlx::any::install_default_drivers();
        // An in-memory SQLite database exists per connection; the pool must
        // not fan out across several of them.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 10 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Store> {
        Store::open("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared by the entity modules
// ---------------------------------------------------------------------------

pub(crate) fn get_string(row: &sqlx::any::AnyRow, column: &str) -> Result<String> {
    Ok(row.try_get::<String, _>(column)?)
}

pub(crate) fn get_opt_string(row: &sqlx::any::AnyRow, column: &str) -> Result<Option<String>> {
    Ok(row.try_get::<Option<String>, _>(column)?)
}

pub(crate) fn get_i64(row: &sqlx::any::AnyRow, column: &str) -> Result<i64> {
    Ok(row.try_get::<i64, _>(column)?)
}

pub(crate) fn get_opt_i64(row: &sqlx::any::AnyRow, column: &str) -> Result<Option<i64>> {
    Ok(row.try_get::<Option<i64>, _>(column)?)
}

pub(crate) fn get_json(row: &sqlx::any::AnyRow, column: &str) -> Result<serde_json::Value> {
    let text = get_string(row, column)?;
    Ok(serde_json::from_str(&text)?)
}

/// Parse a stored enum string through the given parser, surfacing corrupt
/// rows as storage errors rather than panics.
pub(crate) fn parse_enum<T>(
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
    what: &str,
) -> Result<T> {
    parse(value).ok_or_else(|| crate::Error::Storage(format!("invalid {what}: '{value}'")))
}
