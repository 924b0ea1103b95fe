//! Domain models.

pub mod agent;
pub mod config;
pub mod event;
pub mod group;
pub mod outcome;
pub mod role;
pub mod task;

pub use agent::{AgentInstance, AgentState, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_STALE_SECS};
pub use config::{Guardrails, LogFormat, LogSettings, TeamSettings};
pub use event::{topics, Event, TopicPattern};
pub use group::Group;
pub use outcome::{ProducedTask, TaskOutcome};
pub use role::{AutoScaleSpec, RoleDefinition, RoutingMode, RoutingRule};
pub use task::{Task, TaskId, TaskPriority, TaskSpec, TaskStatus};
