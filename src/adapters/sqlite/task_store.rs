//! SQLite implementation of the task store.
//!
//! Every compound operation here runs inside a single transaction; the
//! claim is a conditional update so at most one concurrent caller wins.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, GuardrailError};
use crate::domain::models::{Task, TaskId, TaskPriority, TaskStatus};
use crate::domain::ports::task_store::{
    ClaimOutcome, CompletionRecord, DepRef, GraphEntry, TaskFilter, TaskStore,
};

/// Reason written onto dependents felled by a failure cascade.
pub const UPSTREAM_FAILURE: &str = "upstream failure";
/// Reason written onto dependents felled by a cancellation cascade.
pub const UPSTREAM_CANCELLED: &str = "upstream cancelled";

const LIVE_STATUSES: &str = "('blocked', 'pending', 'in_progress')";

/// Fixed-width UTC timestamps so lexicographic ordering in SQL matches
/// chronological ordering.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(format!("bad timestamp {raw}: {e}")))
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    group_id: String,
    parent_id: Option<String>,
    title: String,
    description: String,
    task_type: String,
    assigned_to: String,
    priority: String,
    status: String,
    claimed_by: Option<String>,
    depth: i64,
    retry_count: i64,
    rejection_count: i64,
    rejection_reason: Option<String>,
    failure_reason: Option<String>,
    result_payload: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::Serialization(format!("bad status: {}", row.status)))?;
        let priority = TaskPriority::from_str(&row.priority)
            .ok_or_else(|| DomainError::Serialization(format!("bad priority: {}", row.priority)))?;
        let group_id = Uuid::parse_str(&row.group_id)
            .map_err(|e| DomainError::Serialization(format!("bad group id: {e}")))?;
        let claimed_by = row
            .claimed_by
            .map(|raw| {
                Uuid::parse_str(&raw)
                    .map_err(|e| DomainError::Serialization(format!("bad instance id: {e}")))
            })
            .transpose()?;
        let result_payload = row
            .result_payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;

        Ok(Task {
            id: TaskId::from_string(row.id),
            group_id,
            parent_id: row.parent_id.map(TaskId::from_string),
            title: row.title,
            description: row.description,
            task_type: row.task_type,
            assigned_to: row.assigned_to,
            priority,
            status,
            claimed_by,
            blocked_by: Vec::new(), // loaded separately
            depth: row.depth as u32,
            retry_count: row.retry_count as u32,
            rejection_count: row.rejection_count as u32,
            rejection_reason: row.rejection_reason,
            failure_reason: row.failure_reason,
            result_payload,
            created_at: parse_ts(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_blocked_by(&self, task: &mut Task) -> DomainResult<()> {
        let deps: Vec<(String,)> = sqlx::query_as(
            "SELECT blocked_by_id FROM task_dependencies WHERE task_id = ? ORDER BY blocked_by_id",
        )
        .bind(task.id.as_str())
        .fetch_all(&self.pool)
        .await?;
        task.blocked_by = deps.into_iter().map(|(id,)| TaskId::from_string(id)).collect();
        Ok(())
    }

    async fn fetch_task_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &TaskId,
    ) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut task: Task = row.try_into()?;
        let deps: Vec<(String,)> = sqlx::query_as(
            "SELECT blocked_by_id FROM task_dependencies WHERE task_id = ? ORDER BY blocked_by_id",
        )
        .bind(task.id.as_str())
        .fetch_all(&mut **tx)
        .await?;
        task.blocked_by = deps.into_iter().map(|(id,)| TaskId::from_string(id)).collect();
        Ok(Some(task))
    }

    /// Allocate the next sequence number for a role prefix.
    async fn allocate_seq(tx: &mut Transaction<'_, Sqlite>, prefix: &str) -> DomainResult<u64> {
        let next: i64 = sqlx::query_scalar(
            r#"INSERT INTO id_counters (prefix, next_seq) VALUES (?, 2)
               ON CONFLICT(prefix) DO UPDATE SET next_seq = id_counters.next_seq + 1
               RETURNING next_seq"#,
        )
        .bind(prefix)
        .fetch_one(&mut **tx)
        .await?;
        Ok((next - 1) as u64)
    }

    /// Count of dependencies of `task_id` not yet terminal-successful.
    async fn unsatisfied_deps(
        tx: &mut Transaction<'_, Sqlite>,
        task_id: &str,
    ) -> DomainResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM task_dependencies d
               JOIN tasks t ON t.id = d.blocked_by_id
               WHERE d.task_id = ? AND t.status != 'completed'"#,
        )
        .bind(task_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    /// Shared body of the two cascades: walk dependents breadth-first
    /// and terminal-transition every live one.
    async fn cascade(
        &self,
        origin: &TaskId,
        terminal: TaskStatus,
        reason: &str,
    ) -> DomainResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;
        let now = fmt_ts(Utc::now());

        let mut felled = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([origin.as_str().to_string()]);

        while let Some(current) = queue.pop_front() {
            let dependents: Vec<(String,)> = sqlx::query_as(
                "SELECT task_id FROM task_dependencies WHERE blocked_by_id = ? ORDER BY task_id",
            )
            .bind(&current)
            .fetch_all(&mut *tx)
            .await?;

            for (dep_id,) in dependents {
                if !seen.insert(dep_id.clone()) {
                    continue;
                }
                let updated = sqlx::query(&format!(
                    r#"UPDATE tasks
                       SET status = ?, failure_reason = ?, claimed_by = NULL, completed_at = ?
                       WHERE id = ? AND status IN {LIVE_STATUSES}"#
                ))
                .bind(terminal.as_str())
                .bind(reason)
                .bind(&now)
                .bind(&dep_id)
                .execute(&mut *tx)
                .await?;

                if updated.rows_affected() > 0 {
                    let id = TaskId::from_string(dep_id.clone());
                    if let Some(task) = Self::fetch_task_tx(&mut tx, &id).await? {
                        felled.push(task);
                    }
                }
                queue.push_back(dep_id);
            }
        }

        tx.commit().await?;
        Ok(felled)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_graph(
        &self,
        entries: &[GraphEntry],
        max_live_per_group: Option<u64>,
    ) -> DomainResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted: Vec<Task> = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            entry.spec.validate().map_err(DomainError::Validation)?;

            // Resolve dependency references before allocating the id so a
            // bad batch costs no counter increments beyond its prefix.
            let mut dep_ids: Vec<TaskId> = Vec::with_capacity(entry.deps.len());
            let mut blocking = false;
            let mut upstream_failed = false;
            for dep in &entry.deps {
                match dep {
                    DepRef::Sibling(i) => {
                        if *i >= index {
                            return Err(DomainError::Validation(format!(
                                "sibling dependency {i} does not precede entry {index}"
                            )));
                        }
                        // Siblings are inserted live in this transaction.
                        blocking = true;
                        dep_ids.push(inserted[*i].id.clone());
                    }
                    DepRef::Existing(dep_id) => {
                        let dep_task = Self::fetch_task_tx(&mut tx, dep_id).await?.ok_or_else(
                            || DomainError::UnknownDependency {
                                task_id: TaskId::from_string(format!("{}-?", entry.prefix)),
                                dep_id: dep_id.clone(),
                            },
                        )?;
                        if dep_task.group_id != entry.spec.group_id {
                            return Err(DomainError::CrossGroupDependency {
                                task_id: TaskId::from_string(format!("{}-?", entry.prefix)),
                                dep_id: dep_id.clone(),
                            });
                        }
                        if dep_task.status.is_terminal_failure() {
                            upstream_failed = true;
                        } else if !dep_task.status.is_terminal_success() {
                            blocking = true;
                        }
                        dep_ids.push(dep_id.clone());
                    }
                }
            }

            let seq = Self::allocate_seq(&mut tx, &entry.prefix).await?;
            let id = TaskId::new(&entry.prefix, seq);
            let mut task = Task::from_spec(id, &entry.spec, entry.depth);
            task.blocked_by = dep_ids.clone();
            task.status = if let Some(reason) = &entry.born_failed {
                task.failure_reason = Some(reason.clone());
                task.completed_at = Some(Utc::now());
                TaskStatus::Failed
            } else if upstream_failed {
                task.failure_reason = Some(UPSTREAM_FAILURE.to_string());
                task.completed_at = Some(Utc::now());
                TaskStatus::Failed
            } else if blocking {
                TaskStatus::Blocked
            } else {
                TaskStatus::Pending
            };

            sqlx::query(
                r#"INSERT INTO tasks (id, group_id, parent_id, title, description, task_type,
                   assigned_to, priority, status, claimed_by, depth, retry_count,
                   rejection_count, rejection_reason, failure_reason, result_payload,
                   created_at, started_at, completed_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, 0, ?, ?, ?, NULL, ?, NULL, ?)"#,
            )
            .bind(task.id.as_str())
            .bind(task.group_id.to_string())
            .bind(task.parent_id.as_ref().map(|p| p.as_str().to_string()))
            .bind(&task.title)
            .bind(&task.description)
            .bind(&task.task_type)
            .bind(&task.assigned_to)
            .bind(task.priority.as_str())
            .bind(task.status.as_str())
            .bind(task.depth as i64)
            .bind(task.rejection_count as i64)
            .bind(&task.rejection_reason)
            .bind(&task.failure_reason)
            .bind(fmt_ts(task.created_at))
            .bind(task.completed_at.map(fmt_ts))
            .execute(&mut *tx)
            .await?;

            for dep_id in &dep_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, blocked_by_id) VALUES (?, ?)",
                )
                .bind(task.id.as_str())
                .bind(dep_id.as_str())
                .execute(&mut *tx)
                .await?;
            }

            inserted.push(task);
        }

        // Enforce the per-group live cap against the post-insert state;
        // a breach rolls the whole batch back.
        if let Some(cap) = max_live_per_group {
            let groups: HashSet<Uuid> = entries.iter().map(|e| e.spec.group_id).collect();
            for group_id in groups {
                let live: i64 = sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM tasks WHERE group_id = ? AND status IN {LIVE_STATUSES}"
                ))
                .bind(group_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
                if live as u64 > cap {
                    return Err(GuardrailError::GroupCapExceeded {
                        group_id,
                        live: live as u64,
                        cap,
                    }
                    .into());
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: &TaskId) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut task: Task = row.try_into()?;
                self.load_blocked_by(&mut task).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, task: &Task) -> DomainResult<()> {
        let payload_json = task
            .result_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"UPDATE tasks SET status = ?, priority = ?, assigned_to = ?, claimed_by = ?,
               retry_count = ?, rejection_count = ?, rejection_reason = ?, failure_reason = ?,
               result_payload = ?, started_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(&task.assigned_to)
        .bind(task.claimed_by.map(|id| id.to_string()))
        .bind(task.retry_count as i64)
        .bind(task.rejection_count as i64)
        .bind(&task.rejection_reason)
        .bind(&task.failure_reason)
        .bind(payload_json)
        .bind(task.started_at.map(fmt_ts))
        .bind(task.completed_at.map(fmt_ts))
        .bind(task.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.id.clone()));
        }
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(group_id) = &filter.group_id {
            query.push_str(" AND group_id = ?");
            bindings.push(group_id.to_string());
        }
        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(role) = &filter.assigned_to {
            query.push_str(" AND assigned_to = ?");
            bindings.push(role.clone());
        }
        if let Some(priority) = &filter.priority {
            query.push_str(" AND priority = ?");
            bindings.push(priority.as_str().to_string());
        }
        if let Some(parent_id) = &filter.parent_id {
            query.push_str(" AND parent_id = ?");
            bindings.push(parent_id.as_str().to_string());
        }
        query.push_str(" ORDER BY created_at, id");

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }
        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            self.load_blocked_by(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn next_pending(&self, role: &str) -> DomainResult<Option<TaskId>> {
        let id: Option<(String,)> = sqlx::query_as(
            r#"SELECT id FROM tasks
               WHERE status = 'pending' AND assigned_to = ?
               ORDER BY CASE priority
                   WHEN 'critical' THEN 0
                   WHEN 'high' THEN 1
                   WHEN 'medium' THEN 2
                   ELSE 3
               END, created_at, id
               LIMIT 1"#,
        )
        .bind(role)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|(raw,)| TaskId::from_string(raw)))
    }

    async fn try_claim(&self, task_id: &TaskId, instance_id: Uuid) -> DomainResult<ClaimOutcome> {
        let now = fmt_ts(Utc::now());
        let result = sqlx::query(
            r#"UPDATE tasks
               SET status = 'in_progress', claimed_by = ?, started_at = ?
               WHERE id = ? AND status = 'pending' AND claimed_by IS NULL"#,
        )
        .bind(instance_id.to_string())
        .bind(&now)
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Classify the loss for the caller.
            return Ok(match self.get(task_id).await? {
                Some(task) if task.claimed_by.is_some() => ClaimOutcome::AlreadyClaimed,
                _ => ClaimOutcome::NotPending,
            });
        }
        let task = self
            .get(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;
        Ok(ClaimOutcome::Claimed(task))
    }

    async fn record_completion(
        &self,
        task_id: &TaskId,
        instance_id: Uuid,
        payload: serde_json::Value,
    ) -> DomainResult<CompletionRecord> {
        let mut tx = self.pool.begin().await?;
        let now = fmt_ts(Utc::now());

        let result = sqlx::query(
            r#"UPDATE tasks
               SET status = 'completed', result_payload = ?, claimed_by = NULL, completed_at = ?
               WHERE id = ? AND status = 'in_progress' AND claimed_by = ?"#,
        )
        .bind(serde_json::to_string(&payload)?)
        .bind(&now)
        .bind(task_id.as_str())
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish the late-completion races for the caller.
            let current = Self::fetch_task_tx(&mut tx, task_id).await?;
            return Err(match current {
                None => DomainError::TaskNotFound(task_id.clone()),
                Some(task) if task.status != TaskStatus::InProgress => DomainError::State {
                    task_id: task_id.clone(),
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Completed.as_str().to_string(),
                },
                Some(task) => DomainError::NotClaimHolder {
                    task_id: task_id.clone(),
                    holder: task.claimed_by,
                    caller: instance_id,
                },
            });
        }

        // Unblock dependents whose last unsatisfied dependency this was.
        let dependents: Vec<(String,)> = sqlx::query_as(
            "SELECT task_id FROM task_dependencies WHERE blocked_by_id = ? ORDER BY task_id",
        )
        .bind(task_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut unblocked = Vec::new();
        for (dep_id,) in dependents {
            if Self::unsatisfied_deps(&mut tx, &dep_id).await? > 0 {
                continue;
            }
            let updated = sqlx::query(
                "UPDATE tasks SET status = 'pending' WHERE id = ? AND status = 'blocked'",
            )
            .bind(&dep_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() > 0 {
                let id = TaskId::from_string(dep_id);
                if let Some(task) = Self::fetch_task_tx(&mut tx, &id).await? {
                    unblocked.push(task);
                }
            }
        }

        let task = Self::fetch_task_tx(&mut tx, task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.clone()))?;

        tx.commit().await?;
        Ok(CompletionRecord { task, unblocked })
    }

    async fn cascade_failure(&self, task_id: &TaskId, reason: &str) -> DomainResult<Vec<Task>> {
        self.cascade(task_id, TaskStatus::Failed, reason).await
    }

    async fn cascade_cancel(&self, task_id: &TaskId, reason: &str) -> DomainResult<Vec<Task>> {
        self.cascade(task_id, TaskStatus::Cancelled, reason).await
    }

    async fn reset_stale(
        &self,
        instance_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> DomainResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM tasks
               WHERE claimed_by = ? AND status = 'in_progress' AND started_at < ?
               ORDER BY id"#,
        )
        .bind(instance_id.to_string())
        .bind(fmt_ts(cutoff))
        .fetch_all(&mut *tx)
        .await?;

        let mut reverted = Vec::with_capacity(rows.len());
        for (raw,) in rows {
            sqlx::query(
                r#"UPDATE tasks
                   SET status = 'pending', claimed_by = NULL, started_at = NULL
                   WHERE id = ?"#,
            )
            .bind(&raw)
            .execute(&mut *tx)
            .await?;
            let id = TaskId::from_string(raw);
            if let Some(task) = Self::fetch_task_tx(&mut tx, &id).await? {
                reverted.push(task);
            }
        }

        tx.commit().await?;
        Ok(reverted)
    }

    async fn live_count(&self, group_id: Uuid) -> DomainResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM tasks WHERE group_id = ? AND status IN {LIVE_STATUSES}"
        ))
        .bind(group_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn pending_count(&self, role: &str) -> DomainResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE status = 'pending' AND assigned_to = ?",
        )
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    async fn deps_of(&self, task_id: &TaskId) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               JOIN task_dependencies d ON t.id = d.blocked_by_id
               WHERE d.task_id = ?
               ORDER BY t.id"#,
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn dependents_of(&self, task_id: &TaskId) -> DomainResult<Vec<TaskId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT task_id FROM task_dependencies WHERE blocked_by_id = ? ORDER BY task_id",
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| TaskId::from_string(id)).collect())
    }
}
