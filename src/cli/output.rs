//! Table rendering for CLI listings.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use console::style;

use crate::domain::models::{AgentInstance, AgentState, Task, TaskStatus};

fn status_cell(status: TaskStatus) -> Cell {
    let label = status.as_str();
    let styled = match status {
        TaskStatus::Completed => style(label).green(),
        TaskStatus::Failed | TaskStatus::Rejected => style(label).red(),
        TaskStatus::Cancelled => style(label).dim(),
        TaskStatus::InProgress => style(label).cyan(),
        TaskStatus::Pending => style(label).yellow(),
        TaskStatus::Blocked => style(label).magenta(),
    };
    Cell::new(styled.to_string())
}

pub fn tasks_table(tasks: &[Task]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "ID", "Status", "Role", "Type", "Priority", "Depth", "Title",
        ]);
    for task in tasks {
        table.add_row(vec![
            Cell::new(task.id.as_str()),
            status_cell(task.status),
            Cell::new(&task.assigned_to),
            Cell::new(&task.task_type),
            Cell::new(task.priority.as_str()),
            Cell::new(task.depth),
            Cell::new(&task.title),
        ]);
    }
    table
}

pub fn agents_table(agents: &[AgentInstance]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Instance", "Role", "State", "Task", "Last heartbeat"]);
    for agent in agents {
        let state = match agent.state {
            AgentState::Busy => style(agent.state.as_str()).cyan(),
            AgentState::Stopped => style(agent.state.as_str()).dim(),
            _ => style(agent.state.as_str()).yellow(),
        };
        table.add_row(vec![
            Cell::new(agent.instance_id),
            Cell::new(&agent.role),
            Cell::new(state.to_string()),
            Cell::new(
                agent
                    .current_task_id
                    .as_ref()
                    .map_or("-", |id| id.as_str()),
            ),
            Cell::new(agent.last_heartbeat_at.to_rfc3339()),
        ]);
    }
    table
}

pub fn task_detail(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} — {}\n", style(task.id.as_str()).bold(), task.title));
    out.push_str(&format!("  group:     {}\n", task.group_id));
    out.push_str(&format!("  status:    {}\n", task.status.as_str()));
    out.push_str(&format!("  role:      {}\n", task.assigned_to));
    out.push_str(&format!("  type:      {}\n", task.task_type));
    out.push_str(&format!("  priority:  {}\n", task.priority.as_str()));
    out.push_str(&format!("  depth:     {}\n", task.depth));
    if let Some(parent) = &task.parent_id {
        out.push_str(&format!("  parent:    {parent}\n"));
    }
    if !task.blocked_by.is_empty() {
        let deps: Vec<&str> = task.blocked_by.iter().map(|d| d.as_str()).collect();
        out.push_str(&format!("  blocked by: {}\n", deps.join(", ")));
    }
    if let Some(claimed_by) = &task.claimed_by {
        out.push_str(&format!("  claimed by: {claimed_by}\n"));
    }
    if task.retry_count > 0 {
        out.push_str(&format!("  retries:   {}\n", task.retry_count));
    }
    if task.rejection_count > 0 {
        out.push_str(&format!("  rejections: {}\n", task.rejection_count));
    }
    if let Some(reason) = &task.rejection_reason {
        out.push_str(&format!("  rejection reason: {reason}\n"));
    }
    if let Some(reason) = &task.failure_reason {
        out.push_str(&format!("  failure reason: {reason}\n"));
    }
    out
}
