//! Workflow state manager: the only place instance status changes.
//!
//! Stateless, in the same way the retry helpers are: every function takes the
//! instance it works on. Transitions are validated against
//! `WorkflowStatus::valid_transitions` and stamp the instance timestamps.

use chrono::Utc;
use sagaflow_types::workflow::{HealthReport, HealthStatus, WorkflowInstance, WorkflowStatus};

/// Errors from state transitions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

/// Stateless workflow state machine.
pub struct StateManager;

impl StateManager {
    /// Fail unless `from -> to` is in the transition table.
    pub fn validate_transition(from: WorkflowStatus, to: WorkflowStatus) -> Result<(), StateError> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(StateError::InvalidStateTransition { from, to })
        }
    }

    /// Move `instance` to `to`, stamping `status_changed_at`, `started_at` on
    /// the first RUNNING and `completed_at` once the run has ended.
    pub fn transition(instance: &mut WorkflowInstance, to: WorkflowStatus) -> Result<(), StateError> {
        Self::validate_transition(instance.status, to)?;

        let now = Utc::now();
        let from = instance.status;
        instance.status = to;
        instance.status_changed_at = now;
        if to == WorkflowStatus::Running && instance.started_at.is_none() {
            instance.started_at = Some(now);
        }
        if to.is_terminal() || to == WorkflowStatus::Failed {
            instance.completed_at = Some(now);
        }

        tracing::debug!(
            instance_id = %instance.instance_id,
            from = %from,
            to = %to,
            "workflow state transition"
        );
        Ok(())
    }

    /// PAUSED and FAILED runs can be acted on by an operator.
    pub fn is_recoverable(instance: &WorkflowInstance) -> bool {
        matches!(
            instance.status,
            WorkflowStatus::Paused | WorkflowStatus::Failed
        )
    }

    pub fn needs_intervention(instance: &WorkflowInstance) -> bool {
        matches!(
            instance.status,
            WorkflowStatus::Failed | WorkflowStatus::Compensating
        )
    }

    pub fn time_in_current_state(instance: &WorkflowInstance) -> chrono::Duration {
        Utc::now() - instance.status_changed_at
    }

    /// CRITICAL if FAILED, WARNING if a non-terminal state has lasted longer
    /// than `max_time_in_state`, otherwise OK.
    pub fn check_health(
        instance: &WorkflowInstance,
        max_time_in_state: chrono::Duration,
    ) -> HealthReport {
        let elapsed = Self::time_in_current_state(instance);
        let (status, message) = if instance.status == WorkflowStatus::Failed {
            (
                HealthStatus::Critical,
                format!(
                    "workflow failed: {}",
                    instance.failure_reason.as_deref().unwrap_or("unknown reason")
                ),
            )
        } else if !instance.status.is_terminal() && elapsed > max_time_in_state {
            (
                HealthStatus::Warning,
                format!(
                    "workflow stuck in {} for {}s (max {}s)",
                    instance.status,
                    elapsed.num_seconds(),
                    max_time_in_state.num_seconds()
                ),
            )
        } else {
            (HealthStatus::Ok, format!("workflow is {}", instance.status))
        };

        HealthReport {
            instance_id: instance.instance_id.clone(),
            status,
            workflow_status: instance.status,
            time_in_state_secs: elapsed.num_seconds(),
            message,
        }
    }
}
