//! CLI command handlers.
//!
//! `run` hosts the full orchestrator. The inspection and mutation
//! commands operate on the shared database directly through the task
//! board, without starting a fleet.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::adapters::sqlite::{
    create_pool, Migrator, SqliteAgentStore, SqliteEventStore, SqliteGroupStore, SqliteTaskStore,
};
use crate::cli::output;
use crate::domain::models::{AgentState, Group, TaskId, TaskSpec, TaskStatus, TeamSettings};
use crate::domain::ports::task_store::TaskFilter;
use crate::domain::ports::{AgentStore, EventStore, GroupStore};
use crate::infrastructure::config;
use crate::infrastructure::providers::{CliProvider, CliProviderConfig, ProviderRegistry, ScriptedProvider};
use crate::services::event_bus::EventBus;
use crate::services::orchestrator::{Orchestrator, GOAL_TASK_TYPE};
use crate::services::role_registry::RoleRegistry;
use crate::services::task_board::TaskBoard;

/// Shared wiring for the offline (fleet-less) commands.
struct BoardContext {
    board: Arc<TaskBoard>,
    groups: Arc<dyn GroupStore>,
    agents: Arc<dyn AgentStore>,
    registry: Arc<RoleRegistry>,
    bus: Arc<EventBus>,
    persister: JoinHandle<()>,
    pool: SqlitePool,
}

impl BoardContext {
    async fn open(settings_path: &Path, roles_dir: &Path) -> Result<Self> {
        let settings = config::load_settings(settings_path)?;
        let definitions = config::load_roles(roles_dir)
            .with_context(|| format!("loading roles from {}", roles_dir.display()))?;
        let registry = Arc::new(RoleRegistry::from_definitions(definitions)?);

        let pool = create_pool(&settings.database_path, None).await?;
        Migrator::new(pool.clone()).run().await?;

        let bus = Arc::new(EventBus::new());
        let events: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));
        let persister = {
            let mut subscription = bus.subscribe("*");
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if let Err(err) = events.append(&event).await {
                        tracing::warn!(error = %err, "event persistence failed");
                    }
                }
            })
        };

        let board = Arc::new(TaskBoard::new(
            Arc::new(SqliteTaskStore::new(pool.clone())),
            Arc::clone(&bus),
            Arc::clone(&registry),
            settings.guardrails,
        ));
        Ok(Self {
            board,
            groups: Arc::new(SqliteGroupStore::new(pool.clone())),
            agents: Arc::new(SqliteAgentStore::new(pool.clone())),
            registry,
            bus,
            persister,
            pool,
        })
    }

    async fn close(self) {
        self.bus.close();
        let _ = self.persister.await;
        self.pool.close().await;
    }
}

fn build_providers(settings: &TeamSettings, scripted: bool) -> Arc<ProviderRegistry> {
    let name = settings.default_provider.clone();
    let mut registry = ProviderRegistry::new(name.clone());
    if scripted {
        registry.register(Arc::new(ScriptedProvider::new(name)));
    } else {
        registry.register(Arc::new(CliProvider::new(name, CliProviderConfig::default())));
    }
    Arc::new(registry)
}

/// Run the orchestrator until interrupted (or the store degrades).
/// Returns the process exit code.
pub async fn handle_run(
    settings_path: &Path,
    roles_dir: &Path,
    goal: Option<String>,
    goal_description: &str,
    scripted: bool,
) -> Result<i32> {
    let settings = config::load_settings(settings_path)?;
    let definitions = config::load_roles(roles_dir)
        .with_context(|| format!("loading roles from {}", roles_dir.display()))?;
    let providers = build_providers(&settings, scripted);

    let orchestrator = Orchestrator::start(settings, definitions, providers).await?;

    if let Some(title) = goal {
        let (group_id, root_task_id) = orchestrator.submit_goal(&title, goal_description).await?;
        println!("goal submitted: group {group_id}, root task {root_task_id}");
    }

    let mut degraded = orchestrator.degraded_events();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        event = degraded.recv() => {
            if event.is_some() {
                tracing::error!("store degraded; shutting down");
            }
        }
    }
    drop(degraded);

    let outcome = orchestrator.stop().await;
    Ok(outcome.exit_code())
}

pub async fn handle_goal_submit(
    settings_path: &Path,
    roles_dir: &Path,
    title: &str,
    description: &str,
) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let role = ctx
        .registry
        .role_for_task_type(GOAL_TASK_TYPE)
        .context("no role accepts goal tasks")?;

    let group = Group::new(title, description);
    ctx.groups.insert(&group).await?;
    let spec = TaskSpec::new(group.id, title, description, GOAL_TASK_TYPE, role.role.clone());
    let task = ctx.board.create_task(spec).await?;

    println!("group {}\nroot task {}", group.id, task.id);
    ctx.close().await;
    Ok(())
}

pub async fn handle_goal_list(settings_path: &Path, roles_dir: &Path) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    for group in ctx.groups.list_live().await? {
        println!("{}  {}", group.id, group.title);
    }
    ctx.close().await;
    Ok(())
}

pub async fn handle_task_list(
    settings_path: &Path,
    roles_dir: &Path,
    status: Option<&str>,
    role: Option<&str>,
    group: Option<uuid::Uuid>,
) -> Result<()> {
    let status = status
        .map(|raw| TaskStatus::from_str(raw).with_context(|| format!("unknown status: {raw}")))
        .transpose()?;
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let tasks = ctx
        .board
        .list_tasks(TaskFilter {
            status,
            assigned_to: role.map(str::to_string),
            group_id: group,
            ..TaskFilter::default()
        })
        .await?;
    println!("{}", output::tasks_table(&tasks));
    ctx.close().await;
    Ok(())
}

pub async fn handle_task_show(settings_path: &Path, roles_dir: &Path, id: &str) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let task = ctx.board.get_task(&TaskId::from(id)).await?;
    print!("{}", output::task_detail(&task));
    ctx.close().await;
    Ok(())
}

pub async fn handle_task_cancel(
    settings_path: &Path,
    roles_dir: &Path,
    id: &str,
    reason: &str,
) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let task = ctx.board.cancel_task(&TaskId::from(id), reason).await?;
    println!("cancelled {}", task.id);
    ctx.close().await;
    Ok(())
}

pub async fn handle_task_retry(settings_path: &Path, roles_dir: &Path, id: &str) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let task = ctx.board.retry_task(&TaskId::from(id)).await?;
    println!("re-queued {} as {}", task.id, task.status.as_str());
    ctx.close().await;
    Ok(())
}

pub async fn handle_task_reassign(
    settings_path: &Path,
    roles_dir: &Path,
    id: &str,
    role: &str,
) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let task = ctx.board.reassign_task(&TaskId::from(id), role).await?;
    println!("{} now assigned to {}", task.id, task.assigned_to);
    ctx.close().await;
    Ok(())
}

pub async fn handle_agent_list(settings_path: &Path, roles_dir: &Path) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let agents = ctx.agents.list().await?;
    println!("{}", output::agents_table(&agents));
    ctx.close().await;
    Ok(())
}

/// Write a role's pause flag. A running orchestrator observes it on its
/// next maintenance tick; the flag also survives restarts.
pub async fn handle_role_pause(
    settings_path: &Path,
    roles_dir: &Path,
    role: Option<&str>,
    all: bool,
    paused: bool,
) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let targets: Vec<String> = if all {
        ctx.registry.roles().map(|r| r.role.clone()).collect()
    } else if let Some(role) = role {
        ctx.registry.require(role)?;
        vec![role.to_string()]
    } else {
        anyhow::bail!("specify a role or --all");
    };

    for name in &targets {
        ctx.agents.set_role_paused(name, paused).await?;
        println!("{} {name}", if paused { "paused" } else { "resumed" });
    }
    ctx.close().await;
    Ok(())
}

pub async fn handle_stats(settings_path: &Path, roles_dir: &Path) -> Result<()> {
    let ctx = BoardContext::open(settings_path, roles_dir).await?;
    let counts = ctx.board.count_by_status().await?;
    let agents = ctx.agents.list().await?;
    let paused = ctx.agents.paused_roles().await?;

    for status in [
        TaskStatus::Blocked,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Rejected,
        TaskStatus::Cancelled,
    ] {
        println!(
            "{:<12} {}",
            status.as_str(),
            counts.get(&status).copied().unwrap_or(0)
        );
    }
    let live = agents.iter().filter(|a| a.state.is_live()).count();
    let busy = agents
        .iter()
        .filter(|a| a.state == AgentState::Busy)
        .count();
    println!("{:<12} {live}", "agents");
    println!("{:<12} {busy}", "busy");
    if !paused.is_empty() {
        println!("{:<12} {}", "paused", paused.join(", "));
    }
    ctx.close().await;
    Ok(())
}
