//! Saga compensation: undo completed steps after a workflow failure.
//!
//! The sweep walks `completed_step_ids` in reverse completion order and runs
//! each step's compensation with that step's own recorded output. A failing
//! compensation is recorded as COMPENSATION_FAILED and the sweep continues;
//! the instance still ends COMPENSATED.

use std::time::Duration;

use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{StepStatus, WorkflowInstance, WorkflowStatus};
use serde_json::Value;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowInstanceRepository;

use super::checkpoint::CheckpointManager;
use super::context::WorkflowContext;
use super::definition::WorkflowDefinition;
use super::executor::ExecutorError;
use super::state::StateManager;
use super::step::StepError;

/// Counts reported at the end of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationSummary {
    pub compensated: usize,
    pub failed: usize,
}

/// Steps to compensate, in sweep order.
///
/// Completed steps without a compensation action are left as COMPLETED.
pub fn compensation_order(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Vec<String> {
    instance
        .completed_step_ids
        .iter()
        .rev()
        .filter(|id| definition.step(id).is_some_and(|step| step.has_compensation()))
        .cloned()
        .collect()
}

/// Move a FAILED instance through COMPENSATING to COMPENSATED.
pub(crate) async fn compensate<R: WorkflowInstanceRepository>(
    checkpoint: &CheckpointManager<R>,
    event_bus: &EventBus,
    definition: &WorkflowDefinition,
    instance: &mut WorkflowInstance,
    ctx: &WorkflowContext,
    default_timeout: Duration,
) -> Result<CompensationSummary, ExecutorError> {
    StateManager::transition(instance, WorkflowStatus::Compensating)?;
    checkpoint.checkpoint(instance, ctx).await?;

    let order = compensation_order(definition, instance);
    tracing::info!(
        instance_id = %instance.instance_id,
        steps = ?order,
        "starting compensation"
    );
    event_bus.publish(WorkflowEvent::CompensationStarted {
        instance_id: instance.instance_id.clone(),
        steps: order.clone(),
    });

    let mut summary = CompensationSummary::default();
    for step_id in &order {
        let Some(step) = definition.step(step_id) else {
            continue;
        };
        let output = instance
            .execution(step_id)
            .and_then(|exec| exec.output.clone())
            .unwrap_or(Value::Null);
        let timeout = step.timeout().unwrap_or(default_timeout);

        let result = tokio::time::timeout(timeout, step.compensate_boxed(output, ctx))
            .await
            .unwrap_or(Err(StepError::Timeout(timeout)));
        let error = result.err().map(|e| e.to_string());

        if let Some(exec) = instance.step_executions.get_mut(step_id) {
            match &error {
                None => {
                    exec.status = StepStatus::Compensated;
                    summary.compensated += 1;
                }
                Some(message) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        step_id = %step_id,
                        error = %message,
                        "compensation failed, continuing sweep"
                    );
                    exec.status = StepStatus::CompensationFailed;
                    exec.compensation_error = Some(message.clone());
                    summary.failed += 1;
                }
            }
        }

        event_bus.publish(WorkflowEvent::StepCompensated {
            instance_id: instance.instance_id.clone(),
            step_id: step_id.clone(),
            error,
        });
        checkpoint.checkpoint(instance, ctx).await?;
    }

    StateManager::transition(instance, WorkflowStatus::Compensated)?;
    checkpoint.checkpoint(instance, ctx).await?;

    tracing::info!(
        instance_id = %instance.instance_id,
        compensated = summary.compensated,
        failed = summary.failed,
        "compensation finished"
    );
    event_bus.publish(WorkflowEvent::CompensationCompleted {
        instance_id: instance.instance_id.clone(),
        compensated: summary.compensated,
        failed: summary.failed,
    });

    Ok(summary)
}
