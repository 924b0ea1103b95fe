//! Task store port.
//!
//! The store is the only authority over task rows. Every compound
//! operation listed here commits in a single transaction; the board
//! builds its state machine on top of these primitives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskId, TaskPriority, TaskSpec, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub group_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub priority: Option<TaskPriority>,
    pub parent_id: Option<TaskId>,
}

/// A dependency reference inside a task-graph insertion batch.
///
/// Sibling references point at an earlier entry of the same batch by
/// index; the store resolves them to the ids it allocates. Requiring the
/// index to be strictly smaller than the referencing entry's own index
/// makes a batch acyclic by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    Existing(TaskId),
    Sibling(usize),
}

/// One entry of a task-graph insertion batch.
#[derive(Debug, Clone)]
pub struct GraphEntry {
    pub spec: TaskSpec,
    pub depth: u32,
    pub deps: Vec<DepRef>,
    /// Task-id prefix of the assigned role.
    pub prefix: String,
    /// When set, the row is created already terminal-failed with this
    /// reason; it never becomes claimable.
    pub born_failed: Option<String>,
}

/// Result of a `try_claim` attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// Another instance holds the row.
    AlreadyClaimed,
    /// The row is missing or not in `pending`.
    NotPending,
}

/// Result of `record_completion`: the completed row plus every dependent
/// whose last dependency this completion satisfied.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub task: Task,
    pub unblocked: Vec<Task>,
}

/// Repository interface for task persistence and the atomic compound
/// operations of the claim/completion protocol.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a batch of tasks and their dependency edges atomically.
    ///
    /// Ids are allocated from the per-prefix counters inside the same
    /// transaction. Entries must be ordered so every `DepRef::Sibling`
    /// points backwards. When `max_live_per_group` is set, the whole
    /// batch rolls back if any touched group would exceed that many
    /// live tasks. Returns the inserted tasks in entry order.
    async fn insert_graph(
        &self,
        entries: &[GraphEntry],
        max_live_per_group: Option<u64>,
    ) -> DomainResult<Vec<Task>>;

    async fn get(&self, id: &TaskId) -> DomainResult<Option<Task>>;

    /// Persist a task row mutated by the board (status, counters,
    /// reasons, payload, timestamps).
    async fn update(&self, task: &Task) -> DomainResult<()>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Highest-priority pending task for a role; ties broken by oldest
    /// `created_at`, then id. Indexed scan, never an in-memory sort.
    async fn next_pending(&self, role: &str) -> DomainResult<Option<TaskId>>;

    /// Conditional claim: succeeds only while the row is `pending` and
    /// unclaimed. At most one concurrent caller wins.
    async fn try_claim(&self, task_id: &TaskId, instance_id: Uuid) -> DomainResult<ClaimOutcome>;

    /// Terminal-transition a claimed row and unblock its dependents in
    /// one transaction. Fails with a state/claim error when the row is
    /// not `in_progress` or is claimed by someone else.
    async fn record_completion(
        &self,
        task_id: &TaskId,
        instance_id: Uuid,
        payload: serde_json::Value,
    ) -> DomainResult<CompletionRecord>;

    /// Transitively mark live dependents of a terminal-failed task as
    /// `failed` with the given reason, in one transaction. Returns the
    /// newly failed tasks in dependency (topological) order.
    async fn cascade_failure(&self, task_id: &TaskId, reason: &str) -> DomainResult<Vec<Task>>;

    /// Cancellation cascade; like `cascade_failure` but the dependents
    /// end `cancelled` and keep their rejection counters.
    async fn cascade_cancel(&self, task_id: &TaskId, reason: &str) -> DomainResult<Vec<Task>>;

    /// Return every `in_progress` task claimed by the instance with
    /// `started_at < cutoff` to `pending`, clearing the claim. Returns
    /// the reverted tasks. Idempotent for a stopped instance.
    async fn reset_stale(
        &self,
        instance_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> DomainResult<Vec<Task>>;

    /// Count of live (non-terminal) tasks in a group.
    async fn live_count(&self, group_id: Uuid) -> DomainResult<u64>;

    /// Task counts grouped by status, across all groups.
    async fn count_by_status(&self)
        -> DomainResult<std::collections::HashMap<TaskStatus, u64>>;

    /// Pending queue depth for a role (autoscaler signal).
    async fn pending_count(&self, role: &str) -> DomainResult<u64>;

    /// Direct dependencies of a task, loaded as full rows.
    async fn deps_of(&self, task_id: &TaskId) -> DomainResult<Vec<Task>>;

    /// Ids of tasks that directly depend on the given task.
    async fn dependents_of(&self, task_id: &TaskId) -> DomainResult<Vec<TaskId>>;
}
