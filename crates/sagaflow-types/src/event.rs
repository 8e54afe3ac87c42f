//! Lifecycle events published by the sagaflow executor.
//!
//! `WorkflowEvent` is the single event type broadcast over the engine's event
//! bus. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels, and serialize with a `type` tag for log sinks and the CLI.

use serde::{Deserialize, Serialize};

/// Events emitted while a workflow instance executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The instance moved to RUNNING (first start or resume).
    WorkflowStarted {
        instance_id: String,
        workflow_name: String,
    },

    /// Every step completed or was skipped.
    WorkflowCompleted {
        instance_id: String,
        workflow_name: String,
        steps_completed: usize,
        duration_ms: u64,
    },

    /// A step failed terminally or the global timeout elapsed.
    WorkflowFailed {
        instance_id: String,
        workflow_name: String,
        reason: String,
    },

    WorkflowPaused { instance_id: String },

    WorkflowResumed { instance_id: String },

    WorkflowCancelled { instance_id: String, reason: String },

    /// Compensation sweep started over the listed steps (in sweep order).
    CompensationStarted {
        instance_id: String,
        steps: Vec<String>,
    },

    /// Compensation sweep finished.
    CompensationCompleted {
        instance_id: String,
        compensated: usize,
        failed: usize,
    },

    StepStarted {
        instance_id: String,
        step_id: String,
        step_name: String,
    },

    StepCompleted {
        instance_id: String,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    StepFailed {
        instance_id: String,
        step_id: String,
        error: String,
        attempts: u32,
    },

    /// A retryable failure; the step runs again after `delay_ms`.
    StepRetried {
        instance_id: String,
        step_id: String,
        /// The attempt about to run (1-based).
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    StepSkipped { instance_id: String, step_id: String },

    StepCancelled { instance_id: String, step_id: String },

    StepCompensated {
        instance_id: String,
        step_id: String,
        /// `None` when the compensation action succeeded.
        error: Option<String>,
    },
}

impl WorkflowEvent {
    /// The workflow instance this event belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { instance_id, .. }
            | WorkflowEvent::WorkflowCompleted { instance_id, .. }
            | WorkflowEvent::WorkflowFailed { instance_id, .. }
            | WorkflowEvent::WorkflowPaused { instance_id }
            | WorkflowEvent::WorkflowResumed { instance_id }
            | WorkflowEvent::WorkflowCancelled { instance_id, .. }
            | WorkflowEvent::CompensationStarted { instance_id, .. }
            | WorkflowEvent::CompensationCompleted { instance_id, .. }
            | WorkflowEvent::StepStarted { instance_id, .. }
            | WorkflowEvent::StepCompleted { instance_id, .. }
            | WorkflowEvent::StepFailed { instance_id, .. }
            | WorkflowEvent::StepRetried { instance_id, .. }
            | WorkflowEvent::StepSkipped { instance_id, .. }
            | WorkflowEvent::StepCancelled { instance_id, .. }
            | WorkflowEvent::StepCompensated { instance_id, .. } => instance_id,
        }
    }

    /// The step this event refers to, if it is a step-level event.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepRetried { step_id, .. }
            | WorkflowEvent::StepSkipped { step_id, .. }
            | WorkflowEvent::StepCancelled { step_id, .. }
            | WorkflowEvent::StepCompensated { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}
