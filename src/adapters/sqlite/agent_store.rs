//! SQLite implementation of the agent store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentInstance, AgentState, TaskId};
use crate::domain::ports::AgentStore;

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(format!("bad timestamp {raw}: {e}")))
}

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    instance_id: String,
    role: String,
    status: String,
    current_task_id: Option<String>,
    last_heartbeat_at: String,
    started_at: String,
    stopped_at: Option<String>,
}

impl TryFrom<AgentRow> for AgentInstance {
    type Error = DomainError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(AgentInstance {
            instance_id: Uuid::parse_str(&row.instance_id)
                .map_err(|e| DomainError::Serialization(format!("bad instance id: {e}")))?,
            role: row.role,
            state: AgentState::from_str(&row.status)
                .ok_or_else(|| DomainError::Serialization(format!("bad state: {}", row.status)))?,
            current_task_id: row.current_task_id.map(TaskId::from_string),
            last_heartbeat_at: parse_ts(&row.last_heartbeat_at)?,
            started_at: parse_ts(&row.started_at)?,
            stopped_at: row.stopped_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(Clone)]
pub struct SqliteAgentStore {
    pool: SqlitePool,
}

impl SqliteAgentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentStore for SqliteAgentStore {
    async fn insert(&self, agent: &AgentInstance) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO agents (instance_id, role, status, current_task_id,
               last_heartbeat_at, started_at, stopped_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(agent.instance_id.to_string())
        .bind(&agent.role)
        .bind(agent.state.as_str())
        .bind(agent.current_task_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(fmt_ts(agent.last_heartbeat_at))
        .bind(fmt_ts(agent.started_at))
        .bind(agent.stopped_at.map(fmt_ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, instance_id: Uuid) -> DomainResult<Option<AgentInstance>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<AgentInstance>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_role(&self, role: &str) -> DomainResult<Vec<AgentInstance>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agents WHERE role = ? ORDER BY started_at")
                .bind(role)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_state(
        &self,
        instance_id: Uuid,
        state: AgentState,
        current_task_id: Option<&TaskId>,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE agents SET status = ?, current_task_id = ? WHERE instance_id = ?",
        )
        .bind(state.as_str())
        .bind(current_task_id.map(|id| id.as_str().to_string()))
        .bind(instance_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(instance_id));
        }
        Ok(())
    }

    async fn heartbeat(&self, instance_id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("UPDATE agents SET last_heartbeat_at = ? WHERE instance_id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(instance_id));
        }
        Ok(())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<AgentInstance>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            r#"SELECT * FROM agents
               WHERE status != 'stopped' AND last_heartbeat_at < ?
               ORDER BY last_heartbeat_at"#,
        )
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_stopped(&self, instance_id: Uuid) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE agents
               SET status = 'stopped', current_task_id = NULL, stopped_at = ?
               WHERE instance_id = ?"#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(instance_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(instance_id));
        }
        Ok(())
    }

    async fn set_role_paused(&self, role: &str, paused: bool) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO role_flags (role, paused) VALUES (?, ?)
               ON CONFLICT(role) DO UPDATE SET paused = excluded.paused"#,
        )
        .bind(role)
        .bind(i64::from(paused))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn paused_roles(&self) -> DomainResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT role FROM role_flags WHERE paused = 1 ORDER BY role")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(role,)| role).collect())
    }
}
