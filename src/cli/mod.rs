//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "drover", version, about = "Role-based multi-agent orchestrator")]
pub struct Cli {
    /// Path to the team settings TOML document.
    #[arg(long, default_value = "drover.toml", global = true)]
    pub settings: PathBuf,

    /// Directory of role definition YAML documents.
    #[arg(long, default_value = "roles", global = true)]
    pub roles: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted.
    Run {
        /// Submit a goal immediately after startup.
        #[arg(long)]
        goal: Option<String>,
        /// Description for --goal.
        #[arg(long, default_value = "")]
        goal_description: String,
        /// Use the scripted in-process provider instead of the CLI tool
        /// (dry run).
        #[arg(long)]
        scripted: bool,
    },
    /// Submit and inspect goals.
    #[command(subcommand)]
    Goal(GoalCommands),
    /// Inspect and mutate tasks.
    #[command(subcommand)]
    Task(TaskCommands),
    /// Inspect agent instances.
    #[command(subcommand)]
    Agent(AgentCommands),
    /// Pause and resume role claiming.
    #[command(subcommand)]
    Role(RoleCommands),
    /// Aggregate task and agent counts.
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum GoalCommands {
    /// Create a group and its root task.
    Submit {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List live groups.
    List,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// List tasks, optionally filtered.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        group: Option<uuid::Uuid>,
    },
    /// Show one task in detail.
    Show { id: String },
    /// Cancel a live task (cascades to dependents).
    Cancel {
        id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Re-queue a terminal-failed task.
    Retry { id: String },
    /// Move a waiting task to another role.
    Reassign { id: String, role: String },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    /// List agent instances.
    List,
}

#[derive(Debug, Subcommand)]
pub enum RoleCommands {
    /// Pause claiming for a role (or all roles). Loops finish their
    /// current task first; a running orchestrator picks the flag up on
    /// its next maintenance tick.
    Pause {
        role: Option<String>,
        #[arg(long, conflicts_with = "role")]
        all: bool,
    },
    /// Resume claiming for a role (or all roles).
    Resume {
        role: Option<String>,
        #[arg(long, conflicts_with = "role")]
        all: bool,
    },
}
