//! Domain errors for the drover orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::TaskId;

/// A hard limit the task board refuses to cross.
///
/// Guardrail breaches are surfaced to the caller and never retried.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("task depth {depth} exceeds max_task_depth {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("group {group_id} already holds {live} live tasks (cap {cap})")]
    GroupCapExceeded { group_id: Uuid, live: u64, cap: u64 },

    #[error("dependency cycle detected involving task {0}")]
    DependencyCycle(TaskId),

    #[error("rejection cycle limit exceeded for task {task_id} (limit {limit})")]
    RejectionLimitExceeded { task_id: TaskId, limit: u32 },
}

/// Domain-level errors.
///
/// `Conflict` is expected under contention (a lost claim race) and is
/// handled silently by callers. `Durability` means the store itself is
/// failing; it halts new claims and shuts the orchestrator down.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("group not found: {0}")]
    GroupNotFound(Uuid),

    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("task {task_id} depends on unknown task {dep_id}")]
    UnknownDependency { task_id: TaskId, dep_id: TaskId },

    #[error("task {task_id} depends on {dep_id} from a different group")]
    CrossGroupDependency { task_id: TaskId, dep_id: TaskId },

    #[error(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error("illegal transition for {task_id}: {from} -> {to}")]
    State {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("task {task_id} is claimed by {holder:?}, not by caller {caller}")]
    NotClaimHolder {
        task_id: TaskId,
        holder: Option<Uuid>,
        caller: Uuid,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("durability failure: {0}")]
    Durability(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether this error indicates the store itself is failing.
    pub fn is_durability(&self) -> bool {
        matches!(self, Self::Durability(_))
    }

    /// Whether this error is expected optimistic contention.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Durability(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
