//! Shared fixtures for integration tests.
#![allow(dead_code)]

pub mod database;

use std::sync::Arc;
use std::time::Duration;

use drover::adapters::sqlite::{SqliteAgentStore, SqliteGroupStore, SqliteTaskStore};
use drover::domain::models::{
    Group, Guardrails, RoleDefinition, RoutingRule, Task, TaskSpec, TaskStatus,
};
use drover::domain::ports::{GroupStore, TaskStore};
use drover::services::{EventBus, RoleRegistry, TaskBoard};
use sqlx::SqlitePool;
use uuid::Uuid;

/// pm → coder → reviewer pipeline used across the tests.
pub fn standard_roles() -> Vec<RoleDefinition> {
    let mut pm = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
    pm.produces = vec!["implementation".to_string()];
    pm.routes_to = vec![RoutingRule {
        role: "coder".to_string(),
        task_types: vec!["implementation".to_string()],
    }];

    let mut coder = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
    coder.produces = vec!["review".to_string()];

    let reviewer = RoleDefinition::new("reviewer", "RV", vec!["review".to_string()]);
    vec![pm, coder, reviewer]
}

pub struct BoardFixture {
    pub pool: SqlitePool,
    pub bus: Arc<EventBus>,
    pub board: Arc<TaskBoard>,
    pub tasks: Arc<SqliteTaskStore>,
    pub agents: Arc<SqliteAgentStore>,
    pub groups: Arc<SqliteGroupStore>,
    pub registry: Arc<RoleRegistry>,
    pub group: Group,
}

pub async fn board_fixture() -> BoardFixture {
    board_fixture_with(Guardrails::default()).await
}

pub async fn board_fixture_with(guardrails: Guardrails) -> BoardFixture {
    let pool = database::setup_test_db().await;
    let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
    let agents = Arc::new(SqliteAgentStore::new(pool.clone()));
    let groups = Arc::new(SqliteGroupStore::new(pool.clone()));
    let registry = Arc::new(RoleRegistry::from_definitions(standard_roles()).unwrap());
    let bus = Arc::new(EventBus::new());
    let board = Arc::new(TaskBoard::new(
        tasks.clone() as Arc<dyn TaskStore>,
        Arc::clone(&bus),
        Arc::clone(&registry),
        guardrails,
    ));

    let group = Group::new("Test goal", "A goal used by tests");
    groups.insert(&group).await.unwrap();

    BoardFixture {
        pool,
        bus,
        board,
        tasks,
        agents,
        groups,
        registry,
        group,
    }
}

impl BoardFixture {
    pub fn coder_spec(&self, title: &str) -> TaskSpec {
        TaskSpec::new(self.group.id, title, "do the work", "implementation", "coder")
    }

    pub fn reviewer_spec(&self, title: &str) -> TaskSpec {
        TaskSpec::new(self.group.id, title, "check the work", "review", "reviewer")
    }

    /// Claim the next pending task for a role, asserting one exists.
    pub async fn claim(&self, role: &str, instance: Uuid) -> Task {
        self.board
            .claim_next(role, instance)
            .await
            .unwrap()
            .expect("expected a claimable task")
    }
}

/// Poll until the condition holds or the deadline passes. Conditions
/// must own their captures (`async move` over cloned handles).
pub async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if condition().await {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until a task reaches the given status.
pub async fn wait_for_status(
    board: &Arc<TaskBoard>,
    id: &drover::domain::models::TaskId,
    status: TaskStatus,
    deadline: Duration,
) {
    let what = format!("{id} to reach {}", status.as_str());
    wait_until(&what, deadline, || {
        let board = Arc::clone(board);
        let id = id.clone();
        async move { board.get_task(&id).await.unwrap().status == status }
    })
    .await;
}

/// Count a group's tasks currently in the given status.
pub async fn count_in_status(board: &TaskBoard, group_id: Uuid, status: TaskStatus) -> usize {
    board
        .list_tasks(drover::domain::ports::task_store::TaskFilter {
            group_id: Some(group_id),
            status: Some(status),
            ..Default::default()
        })
        .await
        .unwrap()
        .len()
}
