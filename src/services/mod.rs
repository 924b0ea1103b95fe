//! Orchestration services.

pub mod agent_fleet;
pub mod agent_loop;
pub mod event_bus;
pub mod orchestrator;
pub mod role_registry;
pub mod router;
pub mod task_board;

pub use agent_fleet::AgentFleet;
pub use agent_loop::AgentLoop;
pub use event_bus::{EventBus, Subscription};
pub use orchestrator::{Orchestrator, ShutdownOutcome, SystemStats, GOAL_TASK_TYPE};
pub use role_registry::RoleRegistry;
pub use router::Router;
pub use task_board::{RejectionDisposition, TaskBoard, UnblockReport, MAX_TRANSIENT_RETRIES};
