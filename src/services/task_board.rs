//! The task board: single authority on task state.
//!
//! All transitions flow through here, backed by the store's atomic
//! compound operations. The board enforces guardrails (depth, per-group
//! cap, rejection cycles), runs the claim protocol, and emits the
//! stable event topics for every state change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::adapters::sqlite::{UPSTREAM_CANCELLED, UPSTREAM_FAILURE};
use crate::domain::errors::{DomainError, DomainResult, GuardrailError};
use crate::domain::models::{
    topics, Guardrails, Task, TaskId, TaskOutcome, TaskSpec, TaskStatus,
};
use crate::domain::ports::task_store::{
    ClaimOutcome, CompletionRecord, DepRef, GraphEntry, TaskFilter,
};
use crate::domain::ports::TaskStore;
use crate::services::event_bus::EventBus;
use crate::services::role_registry::RoleRegistry;

/// Transient failures re-queue the task up to this many times.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Reason written onto tasks felled by an exhausted rejection chain.
pub const REJECTION_LIMIT_REASON: &str = "rejection cycle limit exceeded";

/// What a rejection report turned into.
#[derive(Debug, Clone)]
pub enum RejectionDisposition {
    /// A rework task was queued back to the source role.
    Requeued { rejected: Task, child: Task },
    /// The chain hit the cycle limit; the would-be rework task was
    /// created terminal-failed and no further cycle runs.
    LimitExceeded { rejected: Task, child: Task },
}

/// Result of an [`unblock_scan`](TaskBoard::unblock_scan) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnblockReport {
    pub unblocked: usize,
    pub cascaded: usize,
}

pub struct TaskBoard {
    tasks: Arc<dyn TaskStore>,
    bus: Arc<EventBus>,
    registry: Arc<RoleRegistry>,
    guardrails: Guardrails,
    /// Set on the first durability failure; claims stay refused until
    /// the orchestrator restarts.
    claims_halted: AtomicBool,
}

impl TaskBoard {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        bus: Arc<EventBus>,
        registry: Arc<RoleRegistry>,
        guardrails: Guardrails,
    ) -> Self {
        Self {
            tasks,
            bus,
            registry,
            guardrails,
            claims_halted: AtomicBool::new(false),
        }
    }

    pub fn guardrails(&self) -> Guardrails {
        self.guardrails
    }

    pub fn claims_halted(&self) -> bool {
        self.claims_halted.load(Ordering::SeqCst)
    }

    /// Trip the degraded-store latch and tell the world.
    fn trip_durability(&self, err: &DomainError) {
        if !self.claims_halted.swap(true, Ordering::SeqCst) {
            tracing::error!(error = %err, "store degraded; halting new claims");
            self.bus
                .publish_json(topics::STORE_DEGRADED, json!({ "error": err.to_string() }));
        }
    }

    /// Pass-through that latches durability failures.
    fn check<T>(&self, result: DomainResult<T>) -> DomainResult<T> {
        if let Err(err) = &result {
            if err.is_durability() {
                self.trip_durability(err);
            }
        }
        result
    }

    async fn require(&self, task_id: &TaskId) -> DomainResult<Task> {
        self.check(self.tasks.get(task_id).await)?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))
    }

    fn emit_created(&self, task: &Task) {
        self.bus.publish_json(
            topics::TASK_CREATED,
            json!({
                "task_id": task.id,
                "group_id": task.group_id,
                "role": task.assigned_to,
                "task_type": task.task_type,
                "priority": task.priority.as_str(),
                "status": task.status.as_str(),
                "parent_id": task.parent_id,
            }),
        );
    }

    fn emit_terminal(&self, topic: &str, task: &Task, reason: &str) {
        self.bus.publish_json(
            topic,
            json!({
                "task_id": task.id,
                "group_id": task.group_id,
                "role": task.assigned_to,
                "reason": reason,
            }),
        );
    }

    /// Validate a creation batch and insert it atomically.
    ///
    /// Every entry's role must exist and accept the entry's task type;
    /// depth is checked against the guardrail here, the per-group live
    /// cap inside the store transaction.
    pub async fn create_task_graph(&self, entries: Vec<GraphEntry>) -> DomainResult<Vec<Task>> {
        for entry in &entries {
            let role = self.registry.require(&entry.spec.assigned_to)?;
            if !role.accepts_task_type(&entry.spec.task_type) {
                return Err(DomainError::Validation(format!(
                    "role {} does not accept task type {}",
                    role.role, entry.spec.task_type
                )));
            }
            if entry.depth > self.guardrails.max_task_depth {
                return Err(GuardrailError::DepthExceeded {
                    depth: entry.depth,
                    max: self.guardrails.max_task_depth,
                }
                .into());
            }
        }

        let tasks = self.check(
            self.tasks
                .insert_graph(&entries, Some(self.guardrails.max_tasks_per_group))
                .await,
        )?;

        for task in &tasks {
            tracing::info!(
                task_id = %task.id,
                role = %task.assigned_to,
                status = %task.status.as_str(),
                "task created"
            );
            self.emit_created(task);
            // A child born terminal-failed (failed dependency or an
            // exhausted rejection chain) is announced as created and
            // immediately failed.
            if task.status == TaskStatus::Failed {
                let reason = task.failure_reason.as_deref().unwrap_or(UPSTREAM_FAILURE);
                self.emit_terminal(topics::TASK_FAILED, task, reason);
            }
        }
        Ok(tasks)
    }

    /// Create one task. Depth derives from the parent; `blocked_by`
    /// must reference existing tasks of the same group.
    pub async fn create_task(&self, spec: TaskSpec) -> DomainResult<Task> {
        let role = self.registry.require(&spec.assigned_to)?;
        let depth = match &spec.parent_id {
            Some(parent_id) => self.require(parent_id).await?.depth + 1,
            None => 0,
        };
        let deps = spec
            .blocked_by
            .iter()
            .cloned()
            .map(DepRef::Existing)
            .collect();
        let prefix = role.prefix.clone();

        let mut tasks = self
            .create_task_graph(vec![GraphEntry {
                spec,
                depth,
                deps,
                prefix,
                born_failed: None,
            }])
            .await?;
        Ok(tasks.remove(0))
    }

    /// Claim the best pending task for a role.
    ///
    /// Selection is priority-descending, then oldest `created_at`, then
    /// id. The conditional update makes the claim race-free: losing the
    /// race returns `None` and the loop re-polls.
    pub async fn claim_next(&self, role: &str, instance_id: Uuid) -> DomainResult<Option<Task>> {
        if self.claims_halted() {
            return Ok(None);
        }
        let Some(task_id) = self.check(self.tasks.next_pending(role).await)? else {
            return Ok(None);
        };
        match self.check(self.tasks.try_claim(&task_id, instance_id).await)? {
            // Lost the race either way; the loop re-polls.
            ClaimOutcome::AlreadyClaimed | ClaimOutcome::NotPending => Ok(None),
            ClaimOutcome::Claimed(task) => {
                self.bus.publish_json(
                    topics::TASK_CLAIMED,
                    json!({
                        "task_id": task.id,
                        "group_id": task.group_id,
                        "role": task.assigned_to,
                        "instance_id": instance_id,
                    }),
                );
                Ok(Some(task))
            }
        }
    }

    /// Record a successful completion and unblock dependents atomically.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        instance_id: Uuid,
        outcome: &TaskOutcome,
    ) -> DomainResult<CompletionRecord> {
        let payload = serde_json::to_value(outcome)?;
        let record = self.check(
            self.tasks
                .record_completion(task_id, instance_id, payload.clone())
                .await,
        )?;

        tracing::info!(
            task_id = %record.task.id,
            unblocked = record.unblocked.len(),
            "task completed"
        );
        self.bus.publish_json(
            topics::TASK_COMPLETED,
            json!({
                "task_id": record.task.id,
                "group_id": record.task.group_id,
                "role": record.task.assigned_to,
                "task_type": record.task.task_type,
                "depth": record.task.depth,
                "outcome": payload,
                "unblocked": record.unblocked.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            }),
        );
        Ok(record)
    }

    /// Report a failure. Transient failures re-queue the task while
    /// retries remain; anything else terminal-fails it and cascades.
    pub async fn fail_task(
        &self,
        task_id: &TaskId,
        instance_id: Option<Uuid>,
        error: &str,
        transient: bool,
    ) -> DomainResult<Task> {
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::InProgress {
            return Err(DomainError::State {
                task_id: task_id.clone(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Failed.as_str().to_string(),
            });
        }
        if let Some(caller) = instance_id {
            if task.claimed_by != Some(caller) {
                return Err(DomainError::NotClaimHolder {
                    task_id: task_id.clone(),
                    holder: task.claimed_by,
                    caller,
                });
            }
        }

        let will_retry = transient && task.retry_count < MAX_TRANSIENT_RETRIES;
        if will_retry {
            task.retry_count += 1;
            task.transition_to(TaskStatus::Pending)
                .map_err(DomainError::Validation)?;
        } else {
            task.failure_reason = Some(error.to_string());
            task.transition_to(TaskStatus::Failed)
                .map_err(DomainError::Validation)?;
            task.claimed_by = None;
        }
        self.check(self.tasks.update(&task).await)?;

        tracing::warn!(
            task_id = %task.id,
            transient,
            retry_count = task.retry_count,
            will_retry,
            error,
            "task failed"
        );
        self.bus.publish_json(
            topics::TASK_FAILED,
            json!({
                "task_id": task.id,
                "group_id": task.group_id,
                "role": task.assigned_to,
                "reason": error,
                "transient": transient,
                "retry_count": task.retry_count,
                "will_retry": will_retry,
            }),
        );

        if !will_retry {
            let felled = self.check(self.tasks.cascade_failure(task_id, UPSTREAM_FAILURE).await)?;
            for dependent in &felled {
                self.emit_terminal(topics::TASK_FAILED, dependent, UPSTREAM_FAILURE);
            }
        }
        Ok(task)
    }

    /// Report a rejection verdict on a claimed task.
    ///
    /// The claimed task terminal-transitions to `rejected`, and a rework
    /// task is queued back to `back_to_role` — unless the ancestry chain
    /// already carries `rejection_cycle_limit` rounds of the same
    /// (role, task type) work, in which case the rework task is born
    /// terminal-failed and the cycle ends.
    pub async fn reject_task(
        &self,
        task_id: &TaskId,
        instance_id: Uuid,
        reason: &str,
        back_to_role: &str,
    ) -> DomainResult<RejectionDisposition> {
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::InProgress {
            return Err(DomainError::State {
                task_id: task_id.clone(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Rejected.as_str().to_string(),
            });
        }
        if task.claimed_by != Some(instance_id) {
            return Err(DomainError::NotClaimHolder {
                task_id: task_id.clone(),
                holder: task.claimed_by,
                caller: instance_id,
            });
        }
        let target_role = self.registry.require(back_to_role)?;

        // Walk the ancestry chain once: find the anchor (the nearest
        // ancestor doing the work being sent back) and count how many
        // rounds of that work the chain already carries.
        let chain = self.ancestry(&task).await?;
        let anchor = chain
            .iter()
            .find(|ancestor| ancestor.assigned_to == back_to_role)
            .cloned();
        let requeue_type = anchor
            .as_ref()
            .map(|a| a.task_type.clone())
            .or_else(|| target_role.accepts.first().cloned())
            .ok_or_else(|| {
                DomainError::Validation(format!("role {back_to_role} accepts no task types"))
            })?;
        let occurrences = chain
            .iter()
            .filter(|t| t.assigned_to == back_to_role && t.task_type == requeue_type)
            .count() as u32;
        let limit_hit = occurrences >= self.guardrails.rejection_cycle_limit;

        task.rejection_count += 1;
        task.rejection_reason = Some(reason.to_string());
        task.transition_to(TaskStatus::Rejected)
            .map_err(DomainError::Validation)?;
        task.claimed_by = None;
        self.check(self.tasks.update(&task).await)?;

        tracing::warn!(
            task_id = %task.id,
            back_to_role,
            occurrences,
            limit_hit,
            reason,
            "task rejected"
        );
        self.bus.publish_json(
            topics::TASK_REJECTED,
            json!({
                "task_id": task.id,
                "group_id": task.group_id,
                "role": task.assigned_to,
                "reason": reason,
                "back_to_role": back_to_role,
                "rejection_count": task.rejection_count,
                "terminal": limit_hit,
            }),
        );

        // A rejected task is terminal-failure for its dependents.
        let felled = self.check(self.tasks.cascade_failure(task_id, UPSTREAM_FAILURE).await)?;
        for dependent in &felled {
            self.emit_terminal(topics::TASK_FAILED, dependent, UPSTREAM_FAILURE);
        }

        let (title, description, priority) = match &anchor {
            Some(a) => (a.title.clone(), a.description.clone(), a.priority),
            None => (task.title.clone(), task.description.clone(), task.priority),
        };
        let mut child_spec = TaskSpec::new(
            task.group_id,
            title,
            description,
            requeue_type,
            back_to_role,
        )
        .with_parent(task.id.clone())
        .with_priority(target_role.rejection_priority.unwrap_or(priority));
        child_spec.rejection_reason = Some(reason.to_string());

        // Past the limit, the rework task is born terminal-failed inside
        // the insertion transaction so no loop can ever claim it.
        let mut created = self
            .create_task_graph(vec![GraphEntry {
                spec: child_spec,
                depth: task.depth + 1,
                deps: Vec::new(),
                prefix: target_role.prefix.clone(),
                born_failed: limit_hit.then(|| REJECTION_LIMIT_REASON.to_string()),
            }])
            .await?;
        let child = created.remove(0);

        if limit_hit {
            Ok(RejectionDisposition::LimitExceeded {
                rejected: task,
                child,
            })
        } else {
            Ok(RejectionDisposition::Requeued {
                rejected: task,
                child,
            })
        }
    }

    /// Cancel a live task and cascade cancellation to its dependents.
    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> DomainResult<Task> {
        let mut task = self.require(task_id).await?;
        if task.is_terminal() {
            return Err(DomainError::State {
                task_id: task_id.clone(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Cancelled.as_str().to_string(),
            });
        }
        task.failure_reason = Some(reason.to_string());
        task.transition_to(TaskStatus::Cancelled)
            .map_err(DomainError::Validation)?;
        task.claimed_by = None;
        self.check(self.tasks.update(&task).await)?;
        self.emit_terminal(topics::TASK_CANCELLED, &task, reason);

        let felled = self.check(self.tasks.cascade_cancel(task_id, UPSTREAM_CANCELLED).await)?;
        for dependent in &felled {
            self.emit_terminal(topics::TASK_CANCELLED, dependent, UPSTREAM_CANCELLED);
        }
        Ok(task)
    }

    /// Operator retry of a terminal-failed task: back to the queue.
    pub async fn retry_task(&self, task_id: &TaskId) -> DomainResult<Task> {
        let mut task = self.require(task_id).await?;
        if !task.status.is_terminal_failure() {
            return Err(DomainError::State {
                task_id: task_id.clone(),
                from: task.status.as_str().to_string(),
                to: TaskStatus::Pending.as_str().to_string(),
            });
        }
        task.force_status(TaskStatus::Pending, "operator retry");
        task.failure_reason = None;
        task.completed_at = None;
        self.check(self.tasks.update(&task).await)?;
        self.bus.publish_json(
            topics::TASK_RECOVERED,
            json!({
                "task_id": task.id,
                "group_id": task.group_id,
                "role": task.assigned_to,
                "reason": "operator retry",
            }),
        );
        Ok(task)
    }

    /// Move a waiting task to another role. Refused for `in_progress`
    /// work: cancel and re-create instead.
    pub async fn reassign_task(&self, task_id: &TaskId, role: &str) -> DomainResult<Task> {
        let target = self.registry.require(role)?;
        let mut task = self.require(task_id).await?;
        if !matches!(task.status, TaskStatus::Blocked | TaskStatus::Pending) {
            return Err(DomainError::State {
                task_id: task_id.clone(),
                from: task.status.as_str().to_string(),
                to: format!("assigned_to={role}"),
            });
        }
        if !target.accepts_task_type(&task.task_type) {
            return Err(DomainError::Validation(format!(
                "role {role} does not accept task type {}",
                task.task_type
            )));
        }
        task.assigned_to = target.role.clone();
        self.check(self.tasks.update(&task).await)?;
        Ok(task)
    }

    /// Idempotent pass over a group's blocked tasks: promote those whose
    /// dependencies all succeeded, cascade those with a failed or
    /// cancelled dependency. Used at startup and after bulk operations.
    pub async fn unblock_scan(&self, group_id: Uuid) -> DomainResult<UnblockReport> {
        let blocked = self.check(
            self.tasks
                .list(TaskFilter {
                    group_id: Some(group_id),
                    status: Some(TaskStatus::Blocked),
                    ..TaskFilter::default()
                })
                .await,
        )?;

        let mut report = UnblockReport::default();
        for mut task in blocked {
            let deps = self.check(self.tasks.deps_of(&task.id).await)?;
            let any_cancelled = deps.iter().any(|d| d.status == TaskStatus::Cancelled);
            let any_failed = deps
                .iter()
                .any(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Rejected));

            if any_failed || any_cancelled {
                let (terminal, reason, topic) = if any_failed {
                    (TaskStatus::Failed, UPSTREAM_FAILURE, topics::TASK_FAILED)
                } else {
                    (
                        TaskStatus::Cancelled,
                        UPSTREAM_CANCELLED,
                        topics::TASK_CANCELLED,
                    )
                };
                task.failure_reason = Some(reason.to_string());
                task.transition_to(terminal).map_err(DomainError::Validation)?;
                self.check(self.tasks.update(&task).await)?;
                self.emit_terminal(topic, &task, reason);

                let felled = if any_failed {
                    self.check(self.tasks.cascade_failure(&task.id, UPSTREAM_FAILURE).await)?
                } else {
                    self.check(self.tasks.cascade_cancel(&task.id, UPSTREAM_CANCELLED).await)?
                };
                for dependent in &felled {
                    self.emit_terminal(topic, dependent, reason);
                }
                report.cascaded += 1 + felled.len();
            } else if deps.iter().all(|d| d.status.is_terminal_success()) {
                task.transition_to(TaskStatus::Pending)
                    .map_err(DomainError::Validation)?;
                self.check(self.tasks.update(&task).await)?;
                report.unblocked += 1;
            }
        }
        Ok(report)
    }

    /// Return an instance's stale in-flight tasks to the queue and
    /// announce each recovery. Shared by the heartbeat reaper, startup
    /// orphan recovery, and loop cancellation.
    pub async fn recover_instance(
        &self,
        instance_id: Uuid,
        cutoff: chrono::DateTime<chrono::Utc>,
        reason: &str,
    ) -> DomainResult<Vec<Task>> {
        let reverted = self.check(self.tasks.reset_stale(instance_id, cutoff).await)?;
        for task in &reverted {
            tracing::warn!(
                task_id = %task.id,
                instance_id = %instance_id,
                reason,
                "in-flight task recovered"
            );
            self.bus.publish_json(
                topics::TASK_RECOVERED,
                json!({
                    "task_id": task.id,
                    "group_id": task.group_id,
                    "role": task.assigned_to,
                    "instance_id": instance_id,
                    "reason": reason,
                }),
            );
        }
        Ok(reverted)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> DomainResult<Task> {
        self.require(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.check(self.tasks.list(filter).await)
    }

    pub async fn pending_count(&self, role: &str) -> DomainResult<u64> {
        self.check(self.tasks.pending_count(role).await)
    }

    /// Task counts grouped by status, across all groups.
    pub async fn count_by_status(
        &self,
    ) -> DomainResult<std::collections::HashMap<TaskStatus, u64>> {
        self.check(self.tasks.count_by_status().await)
    }

    /// Ancestry chain from the task to the root, nearest first,
    /// including the task itself.
    pub(crate) async fn ancestry(&self, task: &Task) -> DomainResult<Vec<Task>> {
        let mut chain = vec![task.clone()];
        let mut cursor = task.parent_id.clone();
        // Parent chains are bounded by the depth guardrail; the extra
        // headroom tolerates rejection re-queues at max depth.
        let mut hops = 0u32;
        while let Some(parent_id) = cursor {
            if hops > self.guardrails.max_task_depth * 4 {
                tracing::warn!(task_id = %task.id, "ancestry walk truncated");
                break;
            }
            hops += 1;
            match self.check(self.tasks.get(&parent_id).await)? {
                Some(parent) => {
                    cursor = parent.parent_id.clone();
                    chain.push(parent);
                }
                None => break,
            }
        }
        Ok(chain)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! Inert store stub for wiring-only unit tests.

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use crate::domain::errors::DomainResult;
    use crate::domain::models::{Task, TaskId};
    use crate::domain::ports::task_store::{
        ClaimOutcome, CompletionRecord, GraphEntry, TaskFilter, TaskStore,
    };

    pub struct NullTaskStore;

    #[async_trait]
    impl TaskStore for NullTaskStore {
        async fn insert_graph(
            &self,
            _entries: &[GraphEntry],
            _max_live_per_group: Option<u64>,
        ) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn get(&self, _id: &TaskId) -> DomainResult<Option<Task>> {
            Ok(None)
        }

        async fn update(&self, _task: &Task) -> DomainResult<()> {
            Ok(())
        }

        async fn list(&self, _filter: TaskFilter) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn next_pending(&self, _role: &str) -> DomainResult<Option<TaskId>> {
            Ok(None)
        }

        async fn try_claim(
            &self,
            _task_id: &TaskId,
            _instance_id: Uuid,
        ) -> DomainResult<ClaimOutcome> {
            Ok(ClaimOutcome::NotPending)
        }

        async fn record_completion(
            &self,
            task_id: &TaskId,
            _instance_id: Uuid,
            _payload: serde_json::Value,
        ) -> DomainResult<CompletionRecord> {
            Err(crate::domain::errors::DomainError::TaskNotFound(
                task_id.clone(),
            ))
        }

        async fn cascade_failure(&self, _task_id: &TaskId, _reason: &str) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn cascade_cancel(&self, _task_id: &TaskId, _reason: &str) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn reset_stale(
            &self,
            _instance_id: Uuid,
            _cutoff: DateTime<Utc>,
        ) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn live_count(&self, _group_id: Uuid) -> DomainResult<u64> {
            Ok(0)
        }

        async fn count_by_status(
            &self,
        ) -> DomainResult<std::collections::HashMap<crate::domain::models::TaskStatus, u64>>
        {
            Ok(std::collections::HashMap::new())
        }

        async fn pending_count(&self, _role: &str) -> DomainResult<u64> {
            Ok(0)
        }

        async fn deps_of(&self, _task_id: &TaskId) -> DomainResult<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn dependents_of(&self, _task_id: &TaskId) -> DomainResult<Vec<TaskId>> {
            Ok(Vec::new())
        }
    }
}
