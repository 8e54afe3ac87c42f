//! Commands that drive the executor: run, resume and plan.
//!
//! Runs are process-local: the run lives as long as this command. Ctrl+C
//! cancels the active run, and `--pause-after` pauses it once a given step
//! completes so it can be continued later with `sagaflow resume`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use sagaflow_core::repository::WorkflowInstanceRepository;
use sagaflow_core::workflow::context::WorkflowContext;
use sagaflow_core::workflow::definition::WorkflowDefinition;
use sagaflow_core::workflow::executor::{ExecutionResult, WorkflowExecutor};
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{ExecutionMode, WorkflowStatus};

use crate::demo::{self, DemoOptions};
use crate::state::{AppState, ConcreteExecutor};

use super::instance::{print_instance, status_style};

/// Options for `sagaflow run`.
pub struct RunArgs {
    pub handle: String,
    pub banner_url: Option<String>,
    pub fail_at: Option<String>,
    pub pause_after: Option<String>,
    pub mode: ExecutionMode,
    pub timeout: Option<u64>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(args: RunArgs, state: &AppState, json: bool) -> Result<()> {
    let options = DemoOptions {
        mode: args.mode,
        global_timeout: args.timeout.map(Duration::from_secs),
    };
    let definition = demo::profile_analysis(&options).context("Invalid demo workflow")?;

    for step in [&args.fail_at, &args.pause_after].into_iter().flatten() {
        if !definition.contains_step(step) {
            anyhow::bail!(
                "Unknown step '{step}'. Steps: {}",
                definition.step_ids().collect::<Vec<_>>().join(", ")
            );
        }
    }

    let mut ctx = demo::demo_context(
        &args.handle,
        args.banner_url.as_deref(),
        args.fail_at.as_deref(),
    )?;
    options.record(&mut ctx)?;
    let instance = state
        .executor
        .submit(&definition, ctx)
        .await
        .context("Failed to submit workflow")?;

    if !json {
        println!();
        println!(
            "  {} Running '{}' ({} mode)",
            style("*").green().bold(),
            style(definition.name()).cyan(),
            definition.execution_mode()
        );
        println!("  Instance: {}", instance.instance_id);
        println!();
    }

    let pauser = args
        .pause_after
        .map(|step| spawn_pauser(Arc::clone(&state.executor), &instance.instance_id, step));
    let result = drive(state, &definition, &instance.instance_id, json, Launch::Start).await;
    if let Some(pauser) = pauser {
        pauser.abort();
    }

    report(&result?, json)
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(id: &str, state: &AppState, json: bool) -> Result<()> {
    let instance = state
        .repo()
        .find_by_id(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Workflow instance '{id}' not found"))?;
    if instance.status != WorkflowStatus::Paused {
        anyhow::bail!(
            "Instance '{id}' is {}; only paused instances can be resumed",
            instance.status
        );
    }
    let definition = resume_definition(state, &instance.workflow_name, &instance.context)?;

    if !json {
        println!();
        println!(
            "  {} Resuming '{}' ({} of {} steps done)",
            style("*").green().bold(),
            style(definition.name()).cyan(),
            instance.completed_step_ids.len(),
            definition.len()
        );
        println!();
    }

    let result = drive(state, &definition, id, json, Launch::Resume).await?;
    report(&result, json)
}

/// The definition a paused instance continues under. Demo runs are rebuilt
/// from the options recorded in their context.
fn resume_definition(
    state: &AppState,
    workflow_name: &str,
    context: &serde_json::Value,
) -> Result<Arc<WorkflowDefinition>> {
    if workflow_name != demo::WORKFLOW_NAME {
        return Ok(state.registry.require(workflow_name)?);
    }
    let ctx = WorkflowContext::from_json(context.clone())
        .context("Failed to read instance context")?;
    let options = DemoOptions::from_context(&ctx)?;
    let definition = demo::profile_analysis(&options).context("Invalid demo workflow")?;
    Ok(Arc::new(definition))
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn handle_plan(workflow: &str, state: &AppState, json: bool) -> Result<()> {
    let definition = state.registry.require(workflow)?;
    let waves = definition.execution_plan();

    if json {
        let out = serde_json::json!({
            "workflow": definition.name(),
            "description": definition.description(),
            "mode": definition.execution_mode().to_string(),
            "max_parallel_steps": state.config.executor.max_parallel_steps,
            "waves": waves,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Wave").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Depends on"),
            Cell::new("Compensation"),
        ]);

    for (index, wave) in waves.iter().enumerate() {
        for step_id in wave {
            let deps = definition.dependencies(step_id);
            let compensated = definition
                .step(step_id)
                .is_some_and(|step| step.has_compensation());
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(step_id),
                Cell::new(if deps.is_empty() { "-".to_string() } else { deps.join(", ") }),
                Cell::new(if compensated { "yes" } else { "-" }),
            ]);
        }
    }

    println!();
    println!(
        "  {} {}",
        style(definition.name()).cyan().bold(),
        style(definition.description()).dim()
    );
    println!();
    println!("{table}");
    println!(
        "  {} waves, up to {} steps at once",
        waves.len(),
        state.config.executor.max_parallel_steps
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Launch {
    Start,
    Resume,
}

/// Run or resume an instance, printing progress and cancelling on Ctrl+C.
async fn drive(
    state: &AppState,
    definition: &WorkflowDefinition,
    id: &str,
    json: bool,
    launch: Launch,
) -> Result<ExecutionResult> {
    let executor = &state.executor;
    let printer = (!json).then(|| spawn_progress_printer(executor, id));

    let run = async {
        match launch {
            Launch::Start => executor.start(definition, id).await,
            Launch::Resume => executor.resume(definition, id).await,
        }
    };
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            if !json {
                println!("  {}", style("Interrupted, cancelling run...").yellow());
            }
            executor.cancel(id).await?;
            run.await
        }
    };

    if let Some(printer) = printer {
        // Let the printer drain events published before the run returned.
        tokio::task::yield_now().await;
        printer.abort();
    }
    Ok(result?)
}

fn spawn_pauser(executor: Arc<ConcreteExecutor>, id: &str, step: String) -> JoinHandle<()> {
    let mut rx = executor.event_bus().subscribe();
    let id = id.to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(WorkflowEvent::StepCompleted {
                    instance_id,
                    step_id,
                    ..
                }) if instance_id == id && step_id == step => {
                    if let Err(e) = executor.pause(&id) {
                        tracing::warn!(instance_id = %id, error = %e, "failed to pause run");
                    }
                    return;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_progress_printer(executor: &ConcreteExecutor, id: &str) -> JoinHandle<()> {
    let mut rx = executor.event_bus().subscribe();
    let id = id.to_string();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            };
            if event.instance_id() != id {
                continue;
            }
            if let Some(line) = progress_line(&event) {
                println!("  {line}");
            }
        }
    })
}

fn progress_line(event: &WorkflowEvent) -> Option<String> {
    let line = match event {
        WorkflowEvent::StepStarted { step_name, .. } => {
            format!("{} {}", style("→").dim(), step_name)
        }
        WorkflowEvent::StepCompleted {
            step_id,
            attempts,
            duration_ms,
            ..
        } => format!(
            "{} {} {}",
            style("✓").green(),
            step_id,
            style(format!("({attempts} attempt(s), {duration_ms}ms)")).dim()
        ),
        WorkflowEvent::StepRetried {
            step_id,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "{} {} retrying as attempt {attempt} in {delay_ms}ms: {error}",
            style("↻").yellow(),
            step_id
        ),
        WorkflowEvent::StepSkipped { step_id, .. } => {
            format!("{} {} skipped", style("-").dim(), step_id)
        }
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            format!("{} {} {}", style("✗").red(), step_id, style(error).red())
        }
        WorkflowEvent::StepCancelled { step_id, .. } => {
            format!("{} {} cancelled", style("✗").yellow(), step_id)
        }
        WorkflowEvent::CompensationStarted { steps, .. } => format!(
            "{} compensating {}",
            style("⟲").magenta(),
            steps.join(" → ")
        ),
        WorkflowEvent::StepCompensated { step_id, error, .. } => match error {
            None => format!("{} {} compensated", style("⟲").magenta(), step_id),
            Some(error) => format!(
                "{} {} compensation failed: {}",
                style("✗").red(),
                step_id,
                style(error).red()
            ),
        },
        _ => return None,
    };
    Some(line)
}

fn report(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "instance": result.instance,
            "context": result.context.to_json(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Finished: {}",
        status_style(result.status())
    );
    if result.status() == WorkflowStatus::Paused {
        println!(
            "  Continue with: {}",
            style(format!("sagaflow resume {}", result.instance_id())).dim()
        );
    }
    print_instance(&result.instance);
    Ok(())
}
