//! The per-instance agent loop: poll, claim, execute, report.
//!
//! One loop runs per agent instance. It wakes on `task.created` /
//! `task.recovered` events for its role or on a one-second polling
//! floor, claims through the board, drives the provider subprocess with
//! heartbeats and a wall-clock timeout, and reports the verdict back.
//! A pause is observed between tasks, never mid-execution.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::models::{
    topics, AgentInstance, AgentState, Event, RoleDefinition, Task, TaskOutcome,
    HEARTBEAT_INTERVAL_SECS,
};
use crate::domain::ports::{AgentStore, InvokeRequest, Provider, ProviderError};
use crate::services::event_bus::{EventBus, Subscription};
use crate::services::task_board::TaskBoard;

/// Coarse polling floor when no event arrives.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Transient provider faults are retried this many times per claim,
/// with exponential backoff, before the failure is reported.
pub const MAX_PROVIDER_ATTEMPTS: u32 = 3;

pub struct AgentLoop {
    instance_id: Uuid,
    role: Arc<RoleDefinition>,
    board: Arc<TaskBoard>,
    agents: Arc<dyn AgentStore>,
    bus: Arc<EventBus>,
    provider: Arc<dyn Provider>,
    default_model: Option<String>,
    pause: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: Uuid,
        role: Arc<RoleDefinition>,
        board: Arc<TaskBoard>,
        agents: Arc<dyn AgentStore>,
        bus: Arc<EventBus>,
        provider: Arc<dyn Provider>,
        default_model: Option<String>,
        pause: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            role,
            board,
            agents,
            bus,
            provider,
            default_model,
            pause,
            cancel,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Run until cancelled. Errors inside one loop never escape to
    /// other loops; everything is logged and the loop re-polls.
    pub async fn run(mut self) {
        let instance = AgentInstance {
            instance_id: self.instance_id,
            ..AgentInstance::new(self.role.role.clone())
        };
        if let Err(err) = self.agents.insert(&instance).await {
            tracing::error!(error = %err, "failed to register agent instance");
            return;
        }
        self.announce_state(AgentState::Idle, None);
        tracing::info!(
            instance_id = %self.instance_id,
            role = %self.role.role,
            "agent loop started"
        );

        let mut subscription = self.bus.subscribe("task.*");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if *self.pause.borrow() {
                self.set_state(AgentState::Paused, None).await;
                let mut pause = self.pause.clone();
                // Re-check after the clone: a resume racing the clone
                // must not leave the loop parked.
                if *pause.borrow() {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        changed = pause.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                continue;
            }

            match self.board.claim_next(&self.role.role, self.instance_id).await {
                Ok(Some(task)) => self.execute(task).await,
                Ok(None) => self.wait_for_work(&mut subscription).await,
                Err(err) => {
                    tracing::error!(
                        instance_id = %self.instance_id,
                        error = %err,
                        "claim failed; backing off to poll floor"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }

        if let Err(err) = self.agents.mark_stopped(self.instance_id).await {
            tracing::warn!(error = %err, "failed to mark agent stopped");
        }
        self.announce_state(AgentState::Stopped, None);
        tracing::info!(instance_id = %self.instance_id, "agent loop stopped");
    }

    /// Block on the next wake signal: a matching event, the polling
    /// floor, a pause flip, or cancellation.
    async fn wait_for_work(&mut self, subscription: &mut Subscription) {
        let role = self.role.role.clone();
        let matches = |event: &Event| {
            (event.topic == topics::TASK_CREATED || event.topic == topics::TASK_RECOVERED)
                && event.payload["role"].as_str() == Some(role.as_str())
        };
        let mut pause = self.pause.clone();
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = pause.changed() => {}
            () = async {
                loop {
                    match subscription.recv().await {
                        Some(event) if matches(&event) => break,
                        Some(_) => {}
                        // Bus closed: leave the timer as the only wake-up.
                        None => std::future::pending::<()>().await,
                    }
                }
            } => {}
        }
    }

    async fn execute(&self, task: Task) {
        self.set_state(AgentState::Busy, Some(&task)).await;

        // Heartbeats outlive individual provider attempts and stop with
        // the claim.
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = {
            let agents = Arc::clone(&self.agents);
            let instance_id = self.instance_id;
            let cancel = heartbeat_cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
                ticker.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = agents.heartbeat(instance_id).await {
                                tracing::warn!(error = %err, "heartbeat write failed");
                            }
                        }
                    }
                }
            })
        };

        let result = self.invoke_with_retries(&task).await;
        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        self.report(&task, result).await;
        if !self.cancel.is_cancelled() {
            self.set_state(AgentState::Idle, None).await;
        }
    }

    /// Drive the provider, retrying transient faults with exponential
    /// backoff up to [`MAX_PROVIDER_ATTEMPTS`].
    async fn invoke_with_retries(&self, task: &Task) -> Result<TaskOutcome, ProviderError> {
        let request = InvokeRequest {
            task: task.clone(),
            system_prompt: self.role.system_prompt.clone(),
            tools: self.role.tools.clone(),
            model: self.role.model.clone().or_else(|| self.default_model.clone()),
        };
        let role_timeout = Duration::from_secs(self.role.task_timeout_secs);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_cancel = self.cancel.child_token();
            let (partial_tx, partial_rx) = mpsc::channel::<String>(256);
            let forwarder = self.spawn_partial_forwarder(task, partial_rx);

            let invocation = self
                .provider
                .invoke(request.clone(), partial_tx, attempt_cancel.clone());
            let result = tokio::select! {
                () = self.cancel.cancelled() => {
                    attempt_cancel.cancel();
                    Err(ProviderError::Cancelled)
                }
                outcome = timeout(role_timeout, invocation) => match outcome {
                    Ok(inner) => inner,
                    Err(_) => {
                        attempt_cancel.cancel();
                        Err(ProviderError::Timeout { secs: role_timeout.as_secs() })
                    }
                },
            };
            let _ = forwarder.await;

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(err) if err.is_transient() && attempt < MAX_PROVIDER_ATTEMPTS => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                    tracing::warn!(
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider failure; retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn spawn_partial_forwarder(
        &self,
        task: &Task,
        mut partial_rx: mpsc::Receiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let task_id = task.id.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            while let Some(text) = partial_rx.recv().await {
                bus.publish_json(
                    topics::AGENT_TEXT,
                    json!({
                        "task_id": task_id,
                        "instance_id": instance_id,
                        "text": text,
                    }),
                );
            }
        })
    }

    /// Translate the invocation result into a board report. Board-side
    /// races (the task was reaped, cancelled, or reclaimed meanwhile)
    /// are logged and swallowed; the loop simply re-polls.
    async fn report(&self, task: &Task, result: Result<TaskOutcome, ProviderError>) {
        let disposition = match result {
            Ok(outcome @ TaskOutcome::Success { .. }) => {
                let report = self
                    .board
                    .complete_task(&task.id, self.instance_id, &outcome)
                    .await
                    .map(|_| "completed");
                self.swallow_race(&task.id, report)
            }
            Ok(TaskOutcome::Reject {
                reason,
                back_to_role,
            }) => {
                let report = self
                    .board
                    .reject_task(&task.id, self.instance_id, &reason, &back_to_role)
                    .await
                    .map(|_| "rejected");
                self.swallow_race(&task.id, report)
            }
            Ok(TaskOutcome::Fail { reason, transient }) => {
                let report = self
                    .board
                    .fail_task(&task.id, Some(self.instance_id), &reason, transient)
                    .await
                    .map(|_| "failed");
                self.swallow_race(&task.id, report)
            }
            Err(ProviderError::Cancelled) => {
                // Stop mid-execution: the in-flight task goes back to
                // the queue through the stale-recovery path.
                let recovered = self
                    .board
                    .recover_instance(self.instance_id, Utc::now(), "instance stopping")
                    .await;
                if let Err(err) = recovered {
                    tracing::error!(task_id = %task.id, error = %err, "failed to release task");
                }
                Some("released")
            }
            Err(err) => {
                let transient = err.is_transient();
                let report = self
                    .board
                    .fail_task(&task.id, Some(self.instance_id), &err.to_string(), transient)
                    .await
                    .map(|_| "failed");
                self.swallow_race(&task.id, report)
            }
        };

        if let Some(disposition) = disposition {
            self.bus.publish_json(
                topics::AGENT_RESULT,
                json!({
                    "task_id": task.id,
                    "instance_id": self.instance_id,
                    "role": self.role.role,
                    "disposition": disposition,
                }),
            );
        }
    }

    fn swallow_race(
        &self,
        task_id: &crate::domain::models::TaskId,
        result: Result<&'static str, DomainError>,
    ) -> Option<&'static str> {
        match result {
            Ok(disposition) => Some(disposition),
            Err(
                err @ (DomainError::State { .. }
                | DomainError::NotClaimHolder { .. }
                | DomainError::Conflict(_)),
            ) => {
                tracing::warn!(task_id = %task_id, error = %err, "late report rejected by board");
                None
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "report failed");
                None
            }
        }
    }

    async fn set_state(&self, state: AgentState, task: Option<&Task>) {
        let task_id = task.map(|t| &t.id);
        if let Err(err) = self
            .agents
            .set_state(self.instance_id, state, task_id)
            .await
        {
            tracing::warn!(error = %err, "failed to persist agent state");
        }
        self.announce_state(state, task);
    }

    fn announce_state(&self, state: AgentState, task: Option<&Task>) {
        self.bus.publish_json(
            topics::AGENT_STATUS_CHANGED,
            json!({
                "instance_id": self.instance_id,
                "role": self.role.role,
                "state": state.as_str(),
                "task_id": task.map(|t| t.id.clone()),
            }),
        );
    }
}
