//! Agent store port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentInstance, AgentState, TaskId};

/// Repository interface for agent instance rows.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert(&self, agent: &AgentInstance) -> DomainResult<()>;

    async fn get(&self, instance_id: Uuid) -> DomainResult<Option<AgentInstance>>;

    async fn list(&self) -> DomainResult<Vec<AgentInstance>>;

    async fn list_by_role(&self, role: &str) -> DomainResult<Vec<AgentInstance>>;

    /// Update state and current task in one write.
    async fn set_state(
        &self,
        instance_id: Uuid,
        state: AgentState,
        current_task_id: Option<&TaskId>,
    ) -> DomainResult<()>;

    /// Refresh `last_heartbeat_at`.
    async fn heartbeat(&self, instance_id: Uuid) -> DomainResult<()>;

    /// Live instances whose heartbeat is older than the cutoff.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<AgentInstance>>;

    /// Terminal transition for an instance row.
    async fn mark_stopped(&self, instance_id: Uuid) -> DomainResult<()>;

    /// Persist a role's pause flag. Written by the CLI or the fleet;
    /// re-read by the fleet on every maintenance tick.
    async fn set_role_paused(&self, role: &str, paused: bool) -> DomainResult<()>;

    /// Roles currently flagged paused.
    async fn paused_roles(&self) -> DomainResult<Vec<String>>;
}
