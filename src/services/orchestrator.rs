//! The orchestrator: lifecycle owner and command surface.
//!
//! Wires the store, bus, board, router, and fleet together, recovers
//! state at startup, and exposes the commands consumed by the CLI (and
//! any other front end). Shutdown is graceful with a deadline.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::sqlite::{
    create_pool, Migrator, SqliteAgentStore, SqliteEventStore, SqliteGroupStore, SqliteTaskStore,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    topics, AgentInstance, AgentState, Event, Group, RoleDefinition, Task, TaskId, TaskSpec,
    TaskStatus, TeamSettings,
};
use crate::domain::ports::task_store::TaskFilter;
use crate::domain::ports::{AgentStore, EventStore, GroupStore};
use crate::infrastructure::providers::ProviderRegistry;
use crate::services::agent_fleet::AgentFleet;
use crate::services::event_bus::{EventBus, Subscription};
use crate::services::role_registry::RoleRegistry;
use crate::services::router::Router;
use crate::services::task_board::TaskBoard;

/// Task type given to goal root tasks.
pub const GOAL_TASK_TYPE: &str = "goal";

/// How the orchestrator went down, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean,
    DeadlineExceeded,
    StoreFailure,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::DeadlineExceeded => 1,
            Self::StoreFailure => 2,
        }
    }
}

/// Aggregate counters over tasks, agents, and pause flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemStats {
    pub blocked_tasks: u64,
    pub pending_tasks: u64,
    pub in_progress_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub rejected_tasks: u64,
    pub cancelled_tasks: u64,
    pub live_agents: u64,
    pub busy_agents: u64,
    pub paused_roles: Vec<String>,
}

pub struct Orchestrator {
    settings: TeamSettings,
    registry: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
    board: Arc<TaskBoard>,
    fleet: Arc<AgentFleet>,
    groups: Arc<dyn GroupStore>,
    agents: Arc<dyn AgentStore>,
    background_cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
    pool: SqlitePool,
}

impl Orchestrator {
    /// Open the store, build every component, recover state, and start
    /// the fleet.
    pub async fn start(
        settings: TeamSettings,
        definitions: Vec<RoleDefinition>,
        providers: Arc<ProviderRegistry>,
    ) -> DomainResult<Self> {
        providers.validate()?;
        let registry = Arc::new(RoleRegistry::from_definitions(definitions)?);

        let pool = create_pool(&settings.database_path, None)
            .await
            .map_err(|e| DomainError::Durability(e.to_string()))?;
        Migrator::new(pool.clone())
            .run()
            .await
            .map_err(|e| DomainError::Durability(e.to_string()))?;

        let task_store = Arc::new(SqliteTaskStore::new(pool.clone()));
        let agents: Arc<dyn AgentStore> = Arc::new(SqliteAgentStore::new(pool.clone()));
        let groups: Arc<dyn GroupStore> = Arc::new(SqliteGroupStore::new(pool.clone()));
        let events: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));

        let bus = Arc::new(EventBus::new());
        let board = Arc::new(TaskBoard::new(
            task_store,
            Arc::clone(&bus),
            Arc::clone(&registry),
            settings.guardrails,
        ));

        let background_cancel = CancellationToken::new();
        let mut background = Vec::new();

        // Event persistence rides the bus like any other subscriber;
        // the store itself has no notification path.
        background.push(Self::spawn_event_persister(
            bus.subscribe("*"),
            Arc::clone(&events),
        ));

        let router = Arc::new(Router::new(
            Arc::clone(&board),
            Arc::clone(&registry),
            Arc::clone(&bus),
        ));
        background.push(router.start(background_cancel.child_token()));

        // Reconcile graph state left over from a previous run before
        // any loop starts claiming.
        for group in groups.list_live().await? {
            let report = board.unblock_scan(group.id).await?;
            if report.unblocked > 0 || report.cascaded > 0 {
                tracing::info!(
                    group_id = %group.id,
                    unblocked = report.unblocked,
                    cascaded = report.cascaded,
                    "startup unblock scan reconciled tasks"
                );
            }
        }

        let fleet = Arc::new(AgentFleet::new(
            Arc::clone(&registry),
            Arc::clone(&board),
            Arc::clone(&agents),
            Arc::clone(&bus),
            providers,
            settings.default_model.clone(),
        ));
        fleet.start().await;

        tracing::info!(
            roles = registry.len(),
            database = %settings.database_path,
            "orchestrator started"
        );
        Ok(Self {
            settings,
            registry,
            bus,
            board,
            fleet,
            groups,
            agents,
            background_cancel,
            background,
            pool,
        })
    }

    fn spawn_event_persister(
        mut subscription: Subscription,
        events: Arc<dyn EventStore>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(err) = events.append(&event).await {
                    tracing::warn!(topic = %event.topic, error = %err, "event persistence failed");
                }
            }
        })
    }

    pub fn board(&self) -> Arc<TaskBoard> {
        Arc::clone(&self.board)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn fleet(&self) -> Arc<AgentFleet> {
        Arc::clone(&self.fleet)
    }

    pub fn registry(&self) -> Arc<RoleRegistry> {
        Arc::clone(&self.registry)
    }

    /// Subscription that fires if the store degrades; the process should
    /// shut down when it does.
    pub fn degraded_events(&self) -> Subscription {
        self.bus.subscribe(topics::STORE_DEGRADED)
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    /// Enter a goal: creates the group and its root task.
    pub async fn submit_goal(
        &self,
        title: &str,
        description: &str,
    ) -> DomainResult<(Uuid, TaskId)> {
        let role = self
            .registry
            .role_for_task_type(GOAL_TASK_TYPE)
            .ok_or_else(|| {
                DomainError::Validation(format!("no role accepts task type {GOAL_TASK_TYPE}"))
            })?;

        let group = Group::new(title, description);
        self.groups.insert(&group).await?;

        let spec = TaskSpec::new(group.id, title, description, GOAL_TASK_TYPE, role.role.clone());
        let task = self.board.create_task(spec).await?;
        tracing::info!(group_id = %group.id, root_task_id = %task.id, "goal submitted");
        Ok((group.id, task.id))
    }

    pub async fn create_task(&self, spec: TaskSpec) -> DomainResult<Task> {
        self.board.create_task(spec).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> DomainResult<Task> {
        self.board.cancel_task(task_id, reason).await
    }

    pub async fn retry_task(&self, task_id: &TaskId) -> DomainResult<Task> {
        self.board.retry_task(task_id).await
    }

    pub async fn reassign_task(&self, task_id: &TaskId, role: &str) -> DomainResult<Task> {
        self.board.reassign_task(task_id, role).await
    }

    pub async fn pause_role(&self, role: Option<&str>) {
        self.fleet.pause(role).await;
    }

    pub async fn resume_role(&self, role: Option<&str>) {
        self.fleet.resume(role).await;
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.board.list_tasks(filter).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> DomainResult<Task> {
        self.board.get_task(task_id).await
    }

    pub async fn list_agents(&self) -> DomainResult<Vec<AgentInstance>> {
        self.agents.list().await
    }

    /// Aggregate counts across the whole system.
    pub async fn stats(&self) -> DomainResult<SystemStats> {
        let counts = self.board.count_by_status().await?;
        let agents = self.agents.list().await?;
        let paused_roles = self.agents.paused_roles().await?;
        let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);

        Ok(SystemStats {
            blocked_tasks: count(TaskStatus::Blocked),
            pending_tasks: count(TaskStatus::Pending),
            in_progress_tasks: count(TaskStatus::InProgress),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Failed),
            rejected_tasks: count(TaskStatus::Rejected),
            cancelled_tasks: count(TaskStatus::Cancelled),
            live_agents: agents.iter().filter(|a| a.state.is_live()).count() as u64,
            busy_agents: agents
                .iter()
                .filter(|a| a.state == AgentState::Busy)
                .count() as u64,
            paused_roles,
        })
    }

    pub async fn list_groups(&self) -> DomainResult<Vec<Group>> {
        self.groups.list_live().await
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<Event> {
        let (history, _sub) = self.bus.subscribe_with_history("*");
        history.into_iter().rev().take(limit).rev().collect()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful stop: pause roles, drain in-flight work up to the
    /// deadline, cancel the rest, flush, close.
    pub async fn stop(mut self) -> ShutdownOutcome {
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        tracing::info!(grace_secs = grace.as_secs(), "orchestrator stopping");

        let drained = self.fleet.stop(grace).await;
        self.background_cancel.cancel();
        self.bus.close();
        let _ = futures::future::join_all(self.background.drain(..)).await;
        self.pool.close().await;

        let outcome = if self.board.claims_halted() {
            ShutdownOutcome::StoreFailure
        } else if drained {
            ShutdownOutcome::Clean
        } else {
            ShutdownOutcome::DeadlineExceeded
        };
        tracing::info!(outcome = ?outcome, "orchestrator stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ShutdownOutcome::Clean.exit_code(), 0);
        assert_eq!(ShutdownOutcome::DeadlineExceeded.exit_code(), 1);
        assert_eq!(ShutdownOutcome::StoreFailure.exit_code(), 2);
    }
}
