//! Provider port - interface for external model backends.
//!
//! A provider wraps one command-line model tool. The loop hands it a
//! prompt and tool identifiers, receives streamed partial output, and
//! gets back a [`TaskOutcome`] verdict.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::models::{Task, TaskOutcome};

/// Everything a provider needs for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub task: Task,
    /// Role prompt, opaque to the core.
    pub system_prompt: String,
    /// Tool identifiers, opaque to the core.
    pub tools: Vec<String>,
    pub model: Option<String>,
}

/// Provider failures, split by retryability.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider invocation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),

    #[error("provider invocation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Timeouts and transient faults are retried with backoff; permanent
    /// failures and cancellations are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::Unavailable(_)
        )
    }
}

/// Capability interface over an external model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key for this provider.
    fn name(&self) -> &str;

    /// Cheap readiness probe, used at startup.
    async fn is_available(&self) -> bool;

    /// Run the task to a verdict.
    ///
    /// Partial output lines are pushed onto `partials` as they appear;
    /// dropping the receiver must not fail the invocation. The token is
    /// the loop's stop signal; implementations abort promptly and return
    /// [`ProviderError::Cancelled`] when it fires.
    async fn invoke(
        &self,
        request: InvokeRequest,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ProviderError>;
}
