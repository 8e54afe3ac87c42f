//! Instance inspection and housekeeping commands: status, list, count,
//! health, cancel, delete.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use sagaflow_core::repository::WorkflowInstanceRepository;
use sagaflow_core::workflow::executor::WorkflowExecutor;
use sagaflow_core::workflow::state::StateManager;
use sagaflow_types::workflow::{HealthStatus, StepStatus, WorkflowInstance, WorkflowStatus};

use crate::state::AppState;

/// Show one instance with its step records.
pub async fn show_instance(state: &AppState, id: &str, json: bool) -> Result<()> {
    let instance = load(state, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(&instance.workflow_name).cyan().bold(),
        status_style(instance.status)
    );
    print_instance(&instance);
    Ok(())
}

/// List instances, newest first, optionally filtered by workflow and status.
pub async fn list_instances(
    state: &AppState,
    workflow: Option<&str>,
    status: Option<WorkflowStatus>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let repo = state.repo();
    let mut instances = match (workflow, status) {
        (Some(name), Some(status)) => repo.find_by_workflow_name_and_status(name, status).await,
        (Some(name), None) => repo.find_by_workflow_name(name).await,
        (None, Some(status)) => repo.find_by_status(status).await,
        (None, None) => {
            let mut all = Vec::new();
            for status in WorkflowStatus::ALL {
                all.extend(repo.find_by_status(status).await?);
            }
            all.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.instance_id.cmp(&a.instance_id))
            });
            Ok(all)
        }
    }?;
    instances.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!(
            "  {} No workflow instances yet. Start one with: {}",
            style("i").blue().bold(),
            style("sagaflow run").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::White),
            Cell::new("Workflow").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Steps done").fg(Color::White),
            Cell::new("Created").fg(Color::White),
        ]);

    for instance in &instances {
        table.add_row(vec![
            Cell::new(&instance.instance_id).fg(Color::DarkGrey),
            Cell::new(&instance.workflow_name).fg(Color::Cyan),
            status_cell(instance.status),
            Cell::new(instance.completed_step_ids.len()),
            Cell::new(instance.created_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!("  {} instance(s)", style(instances.len()).bold());
    println!();
    Ok(())
}

/// Count instances, in total or for one status.
pub async fn count_instances(
    state: &AppState,
    status: Option<WorkflowStatus>,
    json: bool,
) -> Result<()> {
    let repo = state.repo();
    let count = match status {
        Some(status) => repo.count_by_status(status).await?,
        None => repo.count().await?,
    };

    if json {
        let out = serde_json::json!({
            "status": status.map(|s| s.to_string()),
            "count": count,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        match status {
            Some(status) => println!("  {} {} instance(s)", style(count).bold(), status),
            None => println!("  {} instance(s)", style(count).bold()),
        }
    }
    Ok(())
}

/// Report whether an instance is stuck or failed.
pub async fn check_health(state: &AppState, id: &str, max_secs: i64, json: bool) -> Result<()> {
    let instance = load(state, id).await?;
    let report = StateManager::check_health(&instance, chrono::Duration::seconds(max_secs));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mark = match report.status {
        HealthStatus::Ok => style("✓ ok").green(),
        HealthStatus::Warning => style("! warning").yellow(),
        HealthStatus::Critical => style("✗ critical").red(),
    };
    println!();
    println!("  {} {}", mark.bold(), report.message);
    println!(
        "  {} {}s in {}",
        style("Time in state:").bold(),
        report.time_in_state_secs,
        report.workflow_status
    );
    if StateManager::is_recoverable(&instance) {
        let hint = if instance.status == WorkflowStatus::Paused {
            format!("sagaflow resume {id}")
        } else {
            format!("sagaflow status {id}")
        };
        println!("  {} {}", style("Next:").bold(), style(hint).dim());
    }
    println!();
    Ok(())
}

/// Cancel a persisted instance.
///
/// Runs live inside the process that started them, so from here a RUNNING
/// snapshot belongs to a process that exited without finishing. It is marked
/// CANCELLED directly.
pub async fn cancel_instance(state: &AppState, id: &str, json: bool) -> Result<()> {
    let mut instance = load(state, id).await?;

    if instance.status == WorkflowStatus::Running && !state.executor.is_active(id) {
        StateManager::transition(&mut instance, WorkflowStatus::Cancelled)?;
        instance.failure_reason = Some("run abandoned, cancelled by user".to_string());
        state
            .repo()
            .save(&instance)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to save instance: {e}"))?;
        tracing::info!(instance_id = id, "abandoned run marked cancelled");
    } else {
        state.executor.cancel(id).await?;
    }

    if json {
        let out = serde_json::json!({ "cancelled": true, "instance_id": id });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Cancelled {}", style("✓").yellow().bold(), style(id).dim());
        println!();
    }
    Ok(())
}

/// Delete an instance record. Non-terminal instances need `--force`.
pub async fn delete_instance(state: &AppState, id: &str, force: bool, json: bool) -> Result<()> {
    let instance = load(state, id).await?;
    if !instance.status.is_terminal() && !force {
        anyhow::bail!(
            "Instance '{id}' is {}. Cancel it first or pass --force",
            instance.status
        );
    }

    let deleted = state
        .repo()
        .delete_by_id(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to delete instance: {e}"))?;

    if json {
        let out = serde_json::json!({ "deleted": deleted, "instance_id": id });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Deleted {}", style("✓").red().bold(), style(id).dim());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared rendering
// ---------------------------------------------------------------------------

async fn load(state: &AppState, id: &str) -> Result<WorkflowInstance> {
    state
        .repo()
        .find_by_id(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Workflow instance '{id}' not found"))
}

/// Print the details block and step table of an instance.
pub fn print_instance(instance: &WorkflowInstance) {
    println!();
    println!("  {}", style("── Details ──").dim());
    println!(
        "  {} {}",
        style("Instance:").bold(),
        style(&instance.instance_id).dim()
    );
    println!("  {} {}", style("Status:").bold(), status_style(instance.status));
    if let Some(reason) = &instance.failure_reason {
        println!("  {} {}", style("Reason:").bold(), style(reason).red());
    }
    println!(
        "  {} {}",
        style("Created:").bold(),
        instance.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed_at) = instance.completed_at {
        println!(
            "  {} {}",
            style("Finished:").bold(),
            completed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if instance.step_executions.is_empty() {
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Attempts").fg(Color::White),
            Cell::new("Duration").fg(Color::White),
            Cell::new("Error").fg(Color::White),
        ]);

    // Completed steps in completion order, then everything else by ID.
    let mut rows: Vec<_> = instance
        .completed_step_ids
        .iter()
        .filter_map(|id| instance.step_executions.get(id))
        .collect();
    rows.extend(
        instance
            .step_executions
            .values()
            .filter(|e| !instance.completed_step_ids.contains(&e.step_id)),
    );

    for execution in rows {
        let duration = match (execution.started_at, execution.completed_at) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        let error = execution
            .compensation_error
            .as_deref()
            .or(execution.error.as_deref())
            .unwrap_or("");
        table.add_row(vec![
            Cell::new(&execution.step_id).fg(Color::Cyan),
            step_status_cell(execution.status),
            Cell::new(execution.attempt),
            Cell::new(duration).fg(Color::DarkGrey),
            Cell::new(error).fg(Color::Red),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

/// Styled status label for inline text.
pub fn status_style(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Completed => format!("{}", style("● completed").green()),
        WorkflowStatus::Running => format!("{}", style("◐ running").cyan()),
        WorkflowStatus::Pending => format!("{}", style("○ pending").dim()),
        WorkflowStatus::Paused => format!("{}", style("◑ paused").yellow()),
        WorkflowStatus::Failed => format!("{}", style("✗ failed").red()),
        WorkflowStatus::Compensating => format!("{}", style("⟲ compensating").magenta()),
        WorkflowStatus::Compensated => format!("{}", style("⟲ compensated").magenta()),
        WorkflowStatus::Cancelled => format!("{}", style("◌ cancelled").dim()),
    }
}

fn status_cell(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Running => Color::Cyan,
        WorkflowStatus::Paused => Color::Yellow,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Compensating | WorkflowStatus::Compensated => Color::Magenta,
        WorkflowStatus::Pending | WorkflowStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Running => Color::Cyan,
        StepStatus::Failed | StepStatus::CompensationFailed => Color::Red,
        StepStatus::Compensated => Color::Magenta,
        StepStatus::Pending | StepStatus::Skipped | StepStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}
