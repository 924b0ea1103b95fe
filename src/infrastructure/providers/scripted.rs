//! Scripted in-process provider.
//!
//! Plays back queued verdicts instead of running a subprocess. Used by
//! dry runs and the end-to-end tests, where it stands in for the real
//! CLI tool with deterministic behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::models::{TaskId, TaskOutcome};
use crate::domain::ports::{InvokeRequest, Provider, ProviderError};

type OutcomeScript = Result<TaskOutcome, String>;

pub struct ScriptedProvider {
    name: String,
    /// Verdict queues keyed by task type; consumed front to back.
    scripts: Mutex<HashMap<String, VecDeque<OutcomeScript>>>,
    /// Played when a task type has no queued verdict.
    fallback: TaskOutcome,
    /// Simulated execution time.
    delay: Duration,
    invocations: Mutex<Vec<TaskId>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            fallback: TaskOutcome::success_empty(),
            delay: Duration::from_millis(10),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fallback(mut self, fallback: TaskOutcome) -> Self {
        self.fallback = fallback;
        self
    }

    /// Queue the next verdict for a task type.
    pub fn push_outcome(&self, task_type: &str, outcome: TaskOutcome) {
        self.scripts
            .lock()
            .expect("script table poisoned")
            .entry(task_type.to_string())
            .or_default()
            .push_back(Ok(outcome));
    }

    /// Queue a transient provider error for a task type.
    pub fn push_transient_error(&self, task_type: &str, message: &str) {
        self.scripts
            .lock()
            .expect("script table poisoned")
            .entry(task_type.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    /// Task ids invoked so far, in order.
    pub fn invocations(&self) -> Vec<TaskId> {
        self.invocations
            .lock()
            .expect("invocation log poisoned")
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        request: InvokeRequest,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ProviderError> {
        self.invocations
            .lock()
            .expect("invocation log poisoned")
            .push(request.task.id.clone());

        let _ = partials
            .send(format!("working on {}", request.task.id))
            .await;

        tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            () = tokio::time::sleep(self.delay) => {}
        }

        let scripted = self
            .scripts
            .lock()
            .expect("script table poisoned")
            .get_mut(&request.task.task_type)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(ProviderError::Transient(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}
