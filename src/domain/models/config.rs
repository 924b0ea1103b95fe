//! Team settings: the orchestrator-wide configuration record.
//!
//! Parsing lives in the infrastructure layer; these are the structured
//! records the core consumes.

use serde::{Deserialize, Serialize};

/// Hard limits enforced by the task board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Guardrails {
    /// Maximum distance of any task from its group's root.
    pub max_task_depth: u32,
    /// Maximum live (non-terminal) tasks per group.
    pub max_tasks_per_group: u64,
    /// Rejection cycles before a task terminal-fails.
    pub rejection_cycle_limit: u32,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_task_depth: 10,
            max_tasks_per_group: 50,
            rejection_cycle_limit: 3,
        }
    }
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamSettings {
    /// Path to the SQLite database file.
    pub database_path: String,
    pub guardrails: Guardrails,
    /// Model handed to providers when a role does not override it.
    pub default_model: Option<String>,
    /// Provider name used when a role does not override it.
    pub default_provider: String,
    /// Grace period before in-flight loops are force-cancelled on stop.
    pub shutdown_grace_secs: u64,
    pub logging: LogSettings,
}

impl Default for TeamSettings {
    fn default() -> Self {
        Self {
            database_path: "drover.db".to_string(),
            guardrails: Guardrails::default(),
            default_model: None,
            default_provider: "cli".to_string(),
            shutdown_grace_secs: 30,
            logging: LogSettings::default(),
        }
    }
}

/// Log output selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level when RUST_LOG is unset.
    pub level: String,
    pub format: LogFormat,
    /// When set, a daily-rolling JSON log file is written here.
    pub log_dir: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_dir: None,
        }
    }
}
