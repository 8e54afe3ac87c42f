//! Workflow domain types for sagaflow.
//!
//! Defines the execution-tracking data model shared by the engine and its
//! storage adapters: the workflow status machine (`WorkflowStatus`), per-step
//! execution records (`StepExecution`), the persisted run snapshot
//! (`WorkflowInstance`) and the health report produced by the state manager.
//!
//! Workflow *definitions* hold trait objects and live in `sagaflow-core`; only
//! the plain enums describing their execution policy are defined here.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition-level policy enums
// ---------------------------------------------------------------------------

/// How the executor dispatches ready steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time, in declaration order.
    Sequential,
    /// Every ready step at once (bounded by the executor's worker pool).
    #[default]
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            other => Err(format!("invalid execution mode: '{other}'")),
        }
    }
}

/// What the executor does with completed steps after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Compensate completed steps in reverse completion order.
    #[default]
    ReverseOrder,
    /// Leave the failed run as-is.
    None,
}

// ---------------------------------------------------------------------------
// Workflow status machine
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl WorkflowStatus {
    /// Every status, in declaration order.
    pub const ALL: [WorkflowStatus; 8] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Compensating,
        WorkflowStatus::Compensated,
        WorkflowStatus::Cancelled,
    ];

    /// The statuses this status may move to.
    pub fn valid_transitions(&self) -> &'static [WorkflowStatus] {
        use WorkflowStatus::*;
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Paused, Completed, Failed, Cancelled],
            Paused => &[Running, Cancelled],
            Failed => &[Compensating],
            Compensating => &[Compensated],
            Completed | Compensated | Cancelled => &[],
        }
    }

    /// Returns `true` if `to` is a valid next status.
    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Stable lowercase name, used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Compensated => "compensated",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lower)
            .ok_or_else(|| format!("invalid workflow status: '{s}'"))
    }
}

/// Status of an individual step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Whether dependants of a step in this status may run.
    pub fn satisfies_dependants(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Cancelled => write!(f, "cancelled"),
            StepStatus::Compensated => write!(f, "compensated"),
            StepStatus::CompensationFailed => write!(f, "compensation_failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step execution record
// ---------------------------------------------------------------------------

/// Execution record for a single step within a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step ID from the workflow definition.
    pub step_id: String,
    /// Step name (denormalized for display).
    pub step_name: String,
    /// Current step status.
    pub status: StepStatus,
    /// Number of attempts made (0 for skipped steps).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON output produced by the step (kept for compensation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message if the step failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error message if the step's compensation action failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
}

impl StepExecution {
    /// A record for a step that has just been dispatched.
    pub fn running(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Running,
            attempt: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            output: None,
            error: None,
            compensation_error: None,
        }
    }

    /// A record for a step whose `should_skip` returned true.
    pub fn skipped(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            attempt: 0,
            started_at: Some(now),
            completed_at: Some(now),
            output: None,
            error: None,
            compensation_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow instance (persisted snapshot)
// ---------------------------------------------------------------------------

/// A single execution of a workflow definition.
///
/// This is the snapshot the persistence port stores: status, context,
/// per-step records and the completion order. It is mutated only by the
/// executor and state manager and never deleted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Opaque identifier (UUIDv7 text), safe to expose externally.
    pub instance_id: String,
    /// Name of the workflow definition being executed.
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// JSON snapshot of the workflow context.
    pub context: serde_json::Value,
    /// Execution records keyed by step ID.
    #[serde(default)]
    pub step_executions: BTreeMap<String, StepExecution>,
    /// IDs of completed steps, in completion order.
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the current status was entered.
    pub status_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl WorkflowInstance {
    /// Create a new PENDING instance with a fresh ID.
    pub fn new(workflow_name: impl Into<String>, context: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::now_v7().to_string(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            context,
            step_executions: BTreeMap::new(),
            completed_step_ids: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            status_changed_at: now,
            failure_reason: None,
        }
    }

    /// Execution record for a step, if one exists.
    pub fn execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions.get(step_id)
    }

    /// Status of a step's execution record, if one exists.
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_executions.get(step_id).map(|e| e.status)
    }

    /// Whether a step is COMPLETED or SKIPPED.
    pub fn is_step_satisfied(&self, step_id: &str) -> bool {
        self.step_status(step_id)
            .is_some_and(|status| status.satisfies_dependants())
    }

    /// Record a successful completion: store the record and append to the completion order.
    pub fn record_completion(&mut self, execution: StepExecution) {
        let step_id = execution.step_id.clone();
        self.step_executions.insert(step_id.clone(), execution);
        if !self.completed_step_ids.contains(&step_id) {
            self.completed_step_ids.push(step_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Health reporting
// ---------------------------------------------------------------------------

/// Health level of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Non-terminal and in the same state longer than allowed.
    Warning,
    /// Failed and waiting for intervention.
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Result of a health check on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub instance_id: String,
    pub status: HealthStatus,
    pub workflow_status: WorkflowStatus,
    /// Seconds spent in the current workflow status.
    pub time_in_state_secs: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
