//! Drover CLI entry point.

use anyhow::Result;
use clap::Parser;

use drover::cli::{commands, AgentCommands, Cli, Commands, GoalCommands, RoleCommands, TaskCommands};
use drover::domain::models::LogSettings;
use drover::infrastructure::{config, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The run command honors the configured log settings; one-shot
    // commands keep quiet defaults.
    let log_settings = match &cli.command {
        Commands::Run { .. } => config::load_settings(&cli.settings)
            .map(|s| s.logging)
            .unwrap_or_default(),
        _ => LogSettings {
            level: "warn".to_string(),
            ..LogSettings::default()
        },
    };
    let _log_guard = logging::init(&log_settings)?;

    match cli.command {
        Commands::Run {
            goal,
            goal_description,
            scripted,
        } => {
            let code = commands::handle_run(
                &cli.settings,
                &cli.roles,
                goal,
                &goal_description,
                scripted,
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Goal(GoalCommands::Submit { title, description }) => {
            commands::handle_goal_submit(&cli.settings, &cli.roles, &title, &description).await?;
        }
        Commands::Goal(GoalCommands::List) => {
            commands::handle_goal_list(&cli.settings, &cli.roles).await?;
        }
        Commands::Task(TaskCommands::List {
            status,
            role,
            group,
        }) => {
            commands::handle_task_list(
                &cli.settings,
                &cli.roles,
                status.as_deref(),
                role.as_deref(),
                group,
            )
            .await?;
        }
        Commands::Task(TaskCommands::Show { id }) => {
            commands::handle_task_show(&cli.settings, &cli.roles, &id).await?;
        }
        Commands::Task(TaskCommands::Cancel { id, reason }) => {
            commands::handle_task_cancel(&cli.settings, &cli.roles, &id, &reason).await?;
        }
        Commands::Task(TaskCommands::Retry { id }) => {
            commands::handle_task_retry(&cli.settings, &cli.roles, &id).await?;
        }
        Commands::Task(TaskCommands::Reassign { id, role }) => {
            commands::handle_task_reassign(&cli.settings, &cli.roles, &id, &role).await?;
        }
        Commands::Agent(AgentCommands::List) => {
            commands::handle_agent_list(&cli.settings, &cli.roles).await?;
        }
        Commands::Role(RoleCommands::Pause { role, all }) => {
            commands::handle_role_pause(&cli.settings, &cli.roles, role.as_deref(), all, true)
                .await?;
        }
        Commands::Role(RoleCommands::Resume { role, all }) => {
            commands::handle_role_pause(&cli.settings, &cli.roles, role.as_deref(), all, false)
                .await?;
        }
        Commands::Stats => {
            commands::handle_stats(&cli.settings, &cli.roles).await?;
        }
    }
    Ok(())
}
