//! Routing policy: turn a completed task into follow-up tasks.
//!
//! The router subscribes to `task.completed`, reads the completion's
//! `produces` declarations, resolves each to a consumer role, and
//! creates the whole child batch in one store transaction with
//! dependencies resolved by local name in topological order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    topics, Event, ProducedTask, RoleDefinition, Task, TaskId, TaskOutcome, TaskSpec,
};
use crate::domain::ports::task_store::{DepRef, GraphEntry};
use crate::services::event_bus::EventBus;
use crate::services::role_registry::RoleRegistry;
use crate::services::task_board::TaskBoard;

pub struct Router {
    board: Arc<TaskBoard>,
    registry: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
}

/// A produced entry whose consumer role resolved.
struct ResolvedChild {
    produced: ProducedTask,
    role: Arc<RoleDefinition>,
}

impl Router {
    pub fn new(board: Arc<TaskBoard>, registry: Arc<RoleRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            board,
            registry,
            bus,
        }
    }

    /// Spawn the router's subscription loop.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut subscription = self.bus.subscribe(topics::TASK_COMPLETED);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if let Err(err) = self.handle_completion(&event).await {
                            tracing::error!(error = %err, "router failed to process completion");
                        }
                    }
                }
            }
            tracing::debug!("router stopped");
        })
    }

    fn drop_production(&self, parent: &TaskId, produced: &ProducedTask, reason: &str) {
        tracing::warn!(
            parent_task_id = %parent,
            name = %produced.name,
            task_type = %produced.task_type,
            reason,
            "dropping produced task"
        );
        self.bus.publish_json(
            topics::ROUTER_DROPPED,
            json!({
                "parent_task_id": parent,
                "name": produced.name,
                "task_type": produced.task_type,
                "reason": reason,
            }),
        );
    }

    pub async fn handle_completion(&self, event: &Event) -> DomainResult<()> {
        // Only well-formed board payloads are routable.
        let Some(task_id) = event.payload["task_id"].as_str() else {
            return Ok(());
        };
        let task_id = TaskId::from_string(task_id);
        let Some(group_id) = event.payload["group_id"]
            .as_str()
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            return Ok(());
        };
        let Some(role) = event.payload["role"].as_str() else {
            return Ok(());
        };
        let depth = event.payload["depth"].as_u64().unwrap_or(0) as u32;
        let Ok(outcome) = serde_json::from_value::<TaskOutcome>(event.payload["outcome"].clone())
        else {
            return Ok(());
        };

        let TaskOutcome::Success { produces, .. } = outcome else {
            return Ok(());
        };
        if produces.is_empty() {
            return Ok(());
        }
        let Some(producer) = self.registry.get(role) else {
            return Ok(());
        };

        let children =
            self.route_children(&task_id, group_id, depth + 1, &producer, produces).await?;
        if !children.is_empty() {
            tracing::info!(
                parent_task_id = %task_id,
                children = children.len(),
                "routed completion into follow-up tasks"
            );
        }
        Ok(())
    }

    /// Resolve, order, and create a batch of produced tasks.
    async fn route_children(
        &self,
        parent: &TaskId,
        group_id: Uuid,
        depth: u32,
        producer: &RoleDefinition,
        produces: Vec<ProducedTask>,
    ) -> DomainResult<Vec<Task>> {
        // Resolve consumer roles first; unknown targets never make it
        // into the batch.
        let mut resolved: Vec<ResolvedChild> = Vec::new();
        let mut names: HashMap<String, usize> = HashMap::new();
        for produced in produces {
            if !producer.produces_task_type(&produced.task_type) {
                self.drop_production(parent, &produced, "task type not produced by role");
                continue;
            }
            let Some(role) = self.registry.resolve_consumer(producer, &produced.task_type) else {
                self.drop_production(parent, &produced, "no consumer role");
                continue;
            };
            if names.contains_key(&produced.name) {
                self.drop_production(parent, &produced, "duplicate local name");
                continue;
            }
            names.insert(produced.name.clone(), resolved.len());
            resolved.push(ResolvedChild { produced, role });
        }

        // Kahn's algorithm over local-name references. Entries whose
        // references are missing (dropped above or never declared) and
        // entries stuck in a cycle are dropped, transitively.
        let order = self.topo_order(parent, &resolved, &names);
        if order.is_empty() {
            return Ok(Vec::new());
        }

        let position: HashMap<usize, usize> = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();
        let mut entries = Vec::with_capacity(order.len());
        for &idx in &order {
            let child = &resolved[idx];
            let deps = child
                .produced
                .blocked_by
                .iter()
                .filter_map(|name| names.get(name))
                .filter_map(|&dep_idx| position.get(&dep_idx))
                .map(|&pos| DepRef::Sibling(pos))
                .collect();
            let mut spec = TaskSpec::new(
                group_id,
                child.produced.title.clone(),
                child.produced.description.clone(),
                child.produced.task_type.clone(),
                child.role.role.clone(),
            )
            .with_parent(parent.clone())
            .with_priority(child.produced.priority);
            spec.blocked_by = Vec::new(); // carried through deps, not spec
            entries.push(GraphEntry {
                spec,
                depth,
                deps,
                prefix: child.role.prefix.clone(),
                born_failed: None,
            });
        }

        match self.board.create_task_graph(entries).await {
            Ok(tasks) => Ok(tasks),
            Err(err) => {
                // The batch is atomic: a guardrail breach drops all of it.
                for &idx in &order {
                    self.drop_production(parent, &resolved[idx].produced, &err.to_string());
                }
                Ok(Vec::new())
            }
        }
    }

    /// Topological order of resolved children by their `blocked_by`
    /// local names. Returns indexes into `resolved`.
    fn topo_order(
        &self,
        parent: &TaskId,
        resolved: &[ResolvedChild],
        names: &HashMap<String, usize>,
    ) -> Vec<usize> {
        let mut indegree: Vec<usize> = vec![0; resolved.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resolved.len()];
        let mut invalid: Vec<bool> = vec![false; resolved.len()];

        for (idx, child) in resolved.iter().enumerate() {
            for name in &child.produced.blocked_by {
                match names.get(name) {
                    Some(&dep_idx) if dep_idx != idx => {
                        indegree[idx] += 1;
                        dependents[dep_idx].push(idx);
                    }
                    _ => {
                        invalid[idx] = true;
                    }
                }
            }
        }

        let mut queue: Vec<usize> = (0..resolved.len())
            .filter(|&i| indegree[i] == 0 && !invalid[i])
            .collect();
        queue.sort_unstable();
        let mut order = Vec::with_capacity(resolved.len());
        let mut cursor = 0;
        while cursor < queue.len() {
            let idx = queue[cursor];
            cursor += 1;
            order.push(idx);
            for &dep in &dependents[idx] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 && !invalid[dep] {
                    queue.push(dep);
                }
            }
        }

        // Whatever did not make the order is cyclic or referenced a
        // dropped sibling.
        for (idx, child) in resolved.iter().enumerate() {
            if !order.contains(&idx) {
                self.drop_production(
                    parent,
                    &child.produced,
                    "unresolved or cyclic dependency reference",
                );
            }
        }
        order
    }
}
