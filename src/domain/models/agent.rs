//! Agent instance domain model.
//!
//! An agent instance is one running worker of a role. Multiple instances
//! of the same role compete for that role's pending tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskId;

/// Heartbeat cadence written by a busy loop.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// An instance with no heartbeat for this long is considered stale and
/// its in-flight work is recovered.
pub const HEARTBEAT_STALE_SECS: i64 = 60;

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Polling for work
    Idle,
    /// Executing a claimed task
    Busy,
    /// Pause observed; idling until resumed
    Paused,
    /// Stop requested; finishing or aborting current work
    Stopping,
    /// No longer running (retired, or reaped as stale)
    Stopped,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "paused" => Some(Self::Paused),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// A running worker of a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub instance_id: Uuid,
    pub role: String,
    pub state: AgentState,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub fn new(role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4(),
            role: role.into(),
            state: AgentState::Idle,
            current_task_id: None,
            last_heartbeat_at: now,
            started_at: now,
            stopped_at: None,
        }
    }

    /// Whether the heartbeat is older than the staleness cutoff.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state.is_live()
            && (now - self.last_heartbeat_at).num_seconds() > HEARTBEAT_STALE_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_instance_is_idle() {
        let agent = AgentInstance::new("coder");
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.current_task_id.is_none());
        assert!(agent.stopped_at.is_none());
    }

    #[test]
    fn test_staleness_cutoff() {
        let mut agent = AgentInstance::new("coder");
        let now = Utc::now();
        assert!(!agent.is_stale(now));

        agent.last_heartbeat_at = now - Duration::seconds(HEARTBEAT_STALE_SECS + 5);
        assert!(agent.is_stale(now));

        // Stopped instances are never reported stale.
        agent.state = AgentState::Stopped;
        assert!(!agent.is_stale(now));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            AgentState::Idle,
            AgentState::Busy,
            AgentState::Paused,
            AgentState::Stopping,
            AgentState::Stopped,
        ] {
            assert_eq!(AgentState::from_str(state.as_str()), Some(state));
        }
    }
}
