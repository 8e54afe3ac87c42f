//! Workflow executor: dependency-driven DAG execution with durable checkpoints.
//!
//! The `DagExecutor` keeps a frontier of ready steps instead of walking fixed
//! waves: after every completion or skip it recomputes which steps have all
//! dependencies COMPLETED or SKIPPED and dispatches them. Dispatched steps run
//! as tasks on a `tokio::JoinSet`, bounded by a semaphore shared across runs.
//! The run loop is the only writer of the instance and its context.
//!
//! # Execution flow
//!
//! 1. `submit` saves a PENDING instance; `start` (or `resume` for a PAUSED
//!    one) moves it to RUNNING.
//! 2. Ready steps are skipped or spawned; each spawned step gets an
//!    immutable context snapshot and a child cancellation token.
//! 3. The loop selects over run cancellation, the global deadline and the
//!    next finished step. Outputs are written to the context on success.
//! 4. The first terminal step failure stops dispatch and cancels in-flight
//!    siblings; the run ends FAILED and, with reverse-order compensation,
//!    completed steps are compensated.
//! 5. Every step completion and status change is checkpointed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sagaflow_types::config::ExecutorSettings;
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{
    CompensationStrategy, ExecutionMode, StepExecution, StepStatus, WorkflowInstance,
    WorkflowStatus,
};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowInstanceRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compensation;
use super::context::{ContextError, WorkflowContext};
use super::dag;
use super::definition::WorkflowDefinition;
use super::state::{StateError, StateManager};
use super::step::{SharedStep, StepError, StepResult};
use super::step_runner::{StepTask, StepTaskOutput};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default workflow-level timeout (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default size of the worker pool.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 8;

/// Executor tuning, usually derived from `EngineConfig::executor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Steps running at once across every run of this executor.
    pub max_parallel_steps: usize,
    /// Used when a step declares no timeout.
    pub default_step_timeout: Duration,
    /// Used when a definition declares no global timeout.
    pub default_global_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            default_global_timeout: Duration::from_secs(DEFAULT_WORKFLOW_TIMEOUT_SECS),
        }
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            max_parallel_steps: settings.max_parallel_steps.max(1),
            default_step_timeout: Duration::from_secs(settings.default_step_timeout_secs),
            default_global_timeout: Duration::from_secs(settings.default_global_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Create and persist a PENDING instance without running it.
    fn submit(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, ExecutorError>> + Send;

    /// Run a PENDING instance to a terminal or paused state.
    fn start(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// `submit` followed by `start`.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Continue a PAUSED instance from its frontier.
    fn resume(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Cancel an active run, or a persisted PENDING/PAUSED instance.
    fn cancel(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;

    /// Stop dispatching, let in-flight steps finish, then pause.
    fn pause(&self, instance_id: &str) -> Result<(), ExecutorError>;

    /// Cancel one in-flight step. Returns `false` if the step is not running.
    fn cancel_step(&self, instance_id: &str, step_id: &str) -> Result<bool, ExecutorError>;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Final snapshot of a run that reached a terminal or paused state.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub instance: WorkflowInstance,
    pub context: WorkflowContext,
}

impl ExecutionResult {
    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.instance.status
    }
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

/// Cancellation handles for one active run.
struct RunControl {
    cancel: CancellationToken,
    pause: CancellationToken,
    /// Tokens of in-flight steps, children of `cancel`.
    steps: DashMap<String, CancellationToken>,
    /// Step id of each spawned task, for tasks that end in a panic.
    tasks: DashMap<task::Id, String>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
            steps: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    fn cancel_steps(&self) {
        for entry in self.steps.iter() {
            entry.value().cancel();
        }
    }
}

/// How the run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Paused,
    Cancelled(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Frontier-driven DAG executor with durable checkpointing.
///
/// Generic over `R: WorkflowInstanceRepository` for storage flexibility.
pub struct DagExecutor<R: WorkflowInstanceRepository> {
    checkpoint: CheckpointManager<R>,
    event_bus: EventBus,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    runs: DashMap<String, Arc<RunControl>>,
}

impl<R: WorkflowInstanceRepository + 'static> DagExecutor<R> {
    pub fn new(repo: R, event_bus: EventBus, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_steps.max(1)));
        Self {
            checkpoint: CheckpointManager::new(repo),
            event_bus,
            config,
            permits,
            runs: DashMap::new(),
        }
    }

    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether `instance_id` is currently running in this executor.
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.runs.contains_key(instance_id)
    }

    fn control(&self, instance_id: &str) -> Option<Arc<RunControl>> {
        self.runs
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn register(&self, instance_id: &str) -> Result<Arc<RunControl>, ExecutorError> {
        match self.runs.entry(instance_id.to_string()) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(instance_id.to_string())),
            Entry::Vacant(slot) => {
                let control = Arc::new(RunControl::new());
                slot.insert(Arc::clone(&control));
                Ok(control)
            }
        }
    }

    /// Load an instance in `expected` status and run it to completion.
    async fn launch(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        expected: WorkflowStatus,
    ) -> Result<ExecutionResult, ExecutorError> {
        // Registered before the snapshot is read, so the status check below
        // cannot see a copy another run of this instance is about to replace.
        let control = self.register(instance_id)?;
        let result = self
            .launch_registered(definition, instance_id, expected, &control)
            .await;
        self.runs.remove(instance_id);
        result
    }

    async fn launch_registered(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
        expected: WorkflowStatus,
        control: &RunControl,
    ) -> Result<ExecutionResult, ExecutorError> {
        let mut instance = self.checkpoint.load(instance_id).await?;
        if instance.workflow_name != definition.name() {
            return Err(ExecutorError::DefinitionMismatch {
                instance_id: instance_id.to_string(),
                expected: definition.name().to_string(),
                actual: instance.workflow_name,
            });
        }
        if instance.status != expected {
            return Err(ExecutorError::UnexpectedStatus {
                instance_id: instance_id.to_string(),
                expected,
                actual: instance.status,
            });
        }
        let ctx = WorkflowContext::from_json(instance.context.clone())?;

        let context = self.run(definition, &mut instance, ctx, control).await?;
        Ok(ExecutionResult { instance, context })
    }

    async fn run(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        mut ctx: WorkflowContext,
        control: &RunControl,
    ) -> Result<WorkflowContext, ExecutorError> {
        let resuming = instance.status == WorkflowStatus::Paused;
        StateManager::transition(instance, WorkflowStatus::Running)?;
        self.checkpoint.checkpoint(instance, &ctx).await?;

        if resuming {
            tracing::info!(
                instance_id = %instance.instance_id,
                workflow = definition.name(),
                completed = instance.completed_step_ids.len(),
                "resuming workflow execution"
            );
            self.event_bus.publish(WorkflowEvent::WorkflowResumed {
                instance_id: instance.instance_id.clone(),
            });
        } else {
            tracing::info!(
                instance_id = %instance.instance_id,
                workflow = definition.name(),
                mode = %definition.execution_mode(),
                steps = definition.len(),
                "starting workflow execution"
            );
            self.event_bus.publish(WorkflowEvent::WorkflowStarted {
                instance_id: instance.instance_id.clone(),
                workflow_name: definition.name().to_string(),
            });
        }

        let run_start = Instant::now();
        let global_timeout = definition
            .global_timeout()
            .unwrap_or(self.config.default_global_timeout);
        let outcome = self
            .drive(definition, instance, &mut ctx, control, run_start + global_timeout, global_timeout)
            .await?;
        self.finish(definition, instance, &ctx, outcome, run_start)
            .await?;
        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        ctx: &mut WorkflowContext,
        control: &RunControl,
        deadline: Instant,
        global_timeout: Duration,
    ) -> Result<RunOutcome, ExecutorError> {
        let mut join_set: JoinSet<StepTaskOutput> = JoinSet::new();
        let mut failure: Option<String> = None;

        loop {
            if failure.is_none() && !control.cancel.is_cancelled() && !control.pause.is_cancelled() {
                self.dispatch_ready(definition, instance, ctx, control, &mut join_set)
                    .await?;
            }
            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    let reason = "cancelled by user".to_string();
                    self.abort_in_flight(instance, control, &mut join_set, &reason).await;
                    self.checkpoint.checkpoint(instance, ctx).await?;
                    return Ok(RunOutcome::Cancelled(reason));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let reason = format!("workflow timed out after {global_timeout:?}");
                    self.abort_in_flight(instance, control, &mut join_set, &reason).await;
                    self.checkpoint.checkpoint(instance, ctx).await?;
                    return Ok(RunOutcome::Failed(reason));
                }
                Some(joined) = join_set.join_next_with_id() => {
                    match joined {
                        Ok((task_id, output)) => {
                            control.tasks.remove(&task_id);
                            self.record_step_result(definition, instance, ctx, control, output, &mut failure);
                        }
                        Err(e) => match control.tasks.remove(&e.id()) {
                            Some((_, step_id)) => {
                                let output = self.panicked_output(definition, instance, ctx, step_id, &e);
                                self.record_step_result(definition, instance, ctx, control, output, &mut failure);
                            }
                            None => {
                                tracing::error!(instance_id = %instance.instance_id, error = %e, "step task aborted");
                                if failure.is_none() {
                                    failure = Some(format!("step task aborted: {e}"));
                                    control.cancel_steps();
                                }
                            }
                        },
                    }
                    self.checkpoint.checkpoint(instance, ctx).await?;
                }
            }
        }

        // Only a task that could not be matched to its step is left RUNNING.
        let now = Utc::now();
        for exec in instance.step_executions.values_mut() {
            if exec.status == StepStatus::Running {
                exec.status = StepStatus::Failed;
                exec.completed_at = Some(now);
                exec.error = Some("step task aborted".to_string());
            }
        }

        let outcome = if let Some(reason) = failure {
            RunOutcome::Failed(reason)
        } else if dag::all_steps_satisfied(definition, instance) {
            RunOutcome::Completed
        } else if control.cancel.is_cancelled() {
            RunOutcome::Cancelled("cancelled by user".to_string())
        } else if control.pause.is_cancelled() {
            RunOutcome::Paused
        } else {
            RunOutcome::Failed("no runnable steps remain".to_string())
        };
        Ok(outcome)
    }

    /// Turn a panicked step task into an ordinary permanent failure.
    fn panicked_output(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        ctx: &WorkflowContext,
        step_id: String,
        join_error: &tokio::task::JoinError,
    ) -> StepTaskOutput {
        let error = StepError::permanent(join_error.to_string());
        tracing::error!(
            instance_id = %instance.instance_id,
            step_id = %step_id,
            error = %join_error,
            "step task panicked"
        );
        if let Some(step) = definition.step(&step_id) {
            step.on_error(&error, ctx);
        }
        let completed_at = Utc::now();
        let started_at = instance
            .execution(&step_id)
            .and_then(|exec| exec.started_at)
            .unwrap_or(completed_at);
        StepTaskOutput {
            step_id,
            result: StepResult::Failure {
                error,
                started_at,
                completed_at,
                attempts: 1,
            },
        }
    }

    /// Skip or spawn every ready step, recomputing the frontier after skips.
    async fn dispatch_ready(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        ctx: &WorkflowContext,
        control: &RunControl,
        join_set: &mut JoinSet<StepTaskOutput>,
    ) -> Result<(), ExecutorError> {
        let sequential = definition.execution_mode() == ExecutionMode::Sequential;
        let mut snapshot: Option<Arc<WorkflowContext>> = None;
        let mut changed = false;

        loop {
            if sequential && !join_set.is_empty() {
                break;
            }
            let ready = dag::ready_steps(definition, instance);
            if ready.is_empty() {
                break;
            }

            let mut skipped = false;
            for node in ready {
                let step = node.step();
                changed = true;
                if step.should_skip(ctx) {
                    self.record_skip(instance, step);
                    skipped = true;
                } else {
                    let snapshot = snapshot.get_or_insert_with(|| Arc::new(ctx.clone()));
                    self.spawn_step(instance, step, Arc::clone(snapshot), control, join_set);
                }
                if sequential {
                    break;
                }
            }
            if !skipped {
                break;
            }
        }

        if changed {
            self.checkpoint.checkpoint(instance, ctx).await?;
        }
        Ok(())
    }

    fn record_skip(&self, instance: &mut WorkflowInstance, step: &SharedStep) {
        tracing::debug!(
            instance_id = %instance.instance_id,
            step_id = step.id(),
            "skipping step"
        );
        instance.step_executions.insert(
            step.id().to_string(),
            StepExecution::skipped(step.id(), step.name()),
        );
        self.event_bus.publish(WorkflowEvent::StepSkipped {
            instance_id: instance.instance_id.clone(),
            step_id: step.id().to_string(),
        });
    }

    fn spawn_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &SharedStep,
        context: Arc<WorkflowContext>,
        control: &RunControl,
        join_set: &mut JoinSet<StepTaskOutput>,
    ) {
        let token = control.cancel.child_token();
        control.steps.insert(step.id().to_string(), token.clone());
        instance.step_executions.insert(
            step.id().to_string(),
            StepExecution::running(step.id(), step.name()),
        );

        let task = StepTask {
            instance_id: instance.instance_id.clone(),
            step: Arc::clone(step),
            context,
            token,
            permits: Arc::clone(&self.permits),
            event_bus: self.event_bus.clone(),
            default_timeout: self.config.default_step_timeout,
        };
        let handle = join_set.spawn(task.run());
        control.tasks.insert(handle.id(), step.id().to_string());
    }

    /// Apply a finished step to the instance and context.
    fn record_step_result(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        ctx: &mut WorkflowContext,
        control: &RunControl,
        output: StepTaskOutput,
        failure: &mut Option<String>,
    ) {
        let StepTaskOutput { step_id, result } = output;
        control.steps.remove(&step_id);
        let Some(step) = definition.step(&step_id) else {
            return;
        };

        let mut exec = instance
            .step_executions
            .remove(&step_id)
            .unwrap_or_else(|| StepExecution::running(&step_id, step.name()));
        exec.attempt = result.attempts();
        exec.completed_at = Some(result.completed_at());
        let duration_ms = result.duration_ms();
        let instance_id = instance.instance_id.clone();

        match result {
            StepResult::Success { value, attempts, .. } => {
                if let Some(key) = step.output_key() {
                    ctx.put_value(key, value.clone());
                }
                exec.status = StepStatus::Completed;
                exec.output = Some(value);
                instance.record_completion(exec);

                tracing::info!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    attempts,
                    duration_ms,
                    "step completed"
                );
                self.event_bus.publish(WorkflowEvent::StepCompleted {
                    instance_id,
                    step_id,
                    attempts,
                    duration_ms,
                });
            }
            StepResult::Failure {
                error: StepError::Cancelled,
                ..
            } if failure.is_some() => {
                exec.status = StepStatus::Cancelled;
                exec.error = Some("cancelled after another step failed".to_string());
                instance.step_executions.insert(step_id.clone(), exec);

                tracing::debug!(instance_id = %instance_id, step_id = %step_id, "step cancelled");
                self.event_bus.publish(WorkflowEvent::StepCancelled {
                    instance_id,
                    step_id,
                });
            }
            StepResult::Failure {
                error, attempts, ..
            } => {
                exec.status = StepStatus::Failed;
                exec.error = Some(error.to_string());
                instance.step_executions.insert(step_id.clone(), exec);

                tracing::warn!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    attempts,
                    error = %error,
                    "step failed"
                );
                self.event_bus.publish(WorkflowEvent::StepFailed {
                    instance_id,
                    step_id: step_id.clone(),
                    error: error.to_string(),
                    attempts,
                });

                if failure.is_none() {
                    *failure = Some(format!("step '{step_id}' failed: {error}"));
                    control.cancel_steps();
                }
            }
        }
    }

    /// Cancel and discard every in-flight step.
    async fn abort_in_flight(
        &self,
        instance: &mut WorkflowInstance,
        control: &RunControl,
        join_set: &mut JoinSet<StepTaskOutput>,
        reason: &str,
    ) {
        control.cancel_steps();
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        control.steps.clear();
        control.tasks.clear();

        let now = Utc::now();
        for exec in instance.step_executions.values_mut() {
            if exec.status == StepStatus::Running {
                exec.status = StepStatus::Cancelled;
                exec.completed_at = Some(now);
                exec.error = Some(reason.to_string());
                self.event_bus.publish(WorkflowEvent::StepCancelled {
                    instance_id: instance.instance_id.clone(),
                    step_id: exec.step_id.clone(),
                });
            }
        }
    }

    /// Apply the final transition(s) for a run outcome.
    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        ctx: &WorkflowContext,
        outcome: RunOutcome,
        run_start: Instant,
    ) -> Result<(), ExecutorError> {
        let instance_id = instance.instance_id.clone();
        match outcome {
            RunOutcome::Completed => {
                StateManager::transition(instance, WorkflowStatus::Completed)?;
                self.checkpoint.checkpoint(instance, ctx).await?;
                let duration_ms = run_start.elapsed().as_millis() as u64;
                tracing::info!(instance_id = %instance_id, duration_ms, "workflow completed");
                self.event_bus.publish(WorkflowEvent::WorkflowCompleted {
                    instance_id,
                    workflow_name: definition.name().to_string(),
                    steps_completed: instance.completed_step_ids.len(),
                    duration_ms,
                });
            }
            RunOutcome::Paused => {
                StateManager::transition(instance, WorkflowStatus::Paused)?;
                self.checkpoint.checkpoint(instance, ctx).await?;
                tracing::info!(instance_id = %instance_id, "workflow paused");
                self.event_bus
                    .publish(WorkflowEvent::WorkflowPaused { instance_id });
            }
            RunOutcome::Cancelled(reason) => {
                instance.failure_reason = Some(reason.clone());
                StateManager::transition(instance, WorkflowStatus::Cancelled)?;
                self.checkpoint.checkpoint(instance, ctx).await?;
                tracing::info!(instance_id = %instance_id, reason = %reason, "workflow cancelled");
                self.event_bus
                    .publish(WorkflowEvent::WorkflowCancelled { instance_id, reason });
            }
            RunOutcome::Failed(reason) => {
                instance.failure_reason = Some(reason.clone());
                StateManager::transition(instance, WorkflowStatus::Failed)?;
                self.checkpoint.checkpoint(instance, ctx).await?;
                tracing::error!(instance_id = %instance_id, reason = %reason, "workflow failed");
                self.event_bus.publish(WorkflowEvent::WorkflowFailed {
                    instance_id,
                    workflow_name: definition.name().to_string(),
                    reason,
                });

                if definition.compensation_strategy() == CompensationStrategy::ReverseOrder {
                    compensation::compensate(
                        &self.checkpoint,
                        &self.event_bus,
                        definition,
                        instance,
                        ctx,
                        self.config.default_step_timeout,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

impl<R: WorkflowInstanceRepository + 'static> WorkflowExecutor for DagExecutor<R> {
    async fn submit(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> Result<WorkflowInstance, ExecutorError> {
        let instance = WorkflowInstance::new(definition.name(), context.to_json());
        self.checkpoint.save(&instance).await?;
        tracing::info!(
            instance_id = %instance.instance_id,
            workflow = definition.name(),
            "submitted workflow instance"
        );
        Ok(instance)
    }

    async fn start(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.launch(definition, instance_id, WorkflowStatus::Pending)
            .await
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let instance = self.submit(definition, context).await?;
        self.start(definition, &instance.instance_id).await
    }

    async fn resume(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.launch(definition, instance_id, WorkflowStatus::Paused)
            .await
    }

    async fn cancel(&self, instance_id: &str) -> Result<(), ExecutorError> {
        if let Some(control) = self.control(instance_id) {
            tracing::info!(instance_id, "cancelling active workflow run");
            control.cancel.cancel();
            return Ok(());
        }

        let mut instance = self.checkpoint.load(instance_id).await?;
        StateManager::transition(&mut instance, WorkflowStatus::Cancelled)?;
        let reason = "cancelled by user".to_string();
        instance.failure_reason = Some(reason.clone());
        self.checkpoint.save(&instance).await?;

        tracing::info!(instance_id, "workflow cancelled");
        self.event_bus.publish(WorkflowEvent::WorkflowCancelled {
            instance_id: instance_id.to_string(),
            reason,
        });
        Ok(())
    }

    fn pause(&self, instance_id: &str) -> Result<(), ExecutorError> {
        let control = self
            .control(instance_id)
            .ok_or_else(|| ExecutorError::RunNotActive(instance_id.to_string()))?;
        tracing::info!(instance_id, "pause requested");
        control.pause.cancel();
        Ok(())
    }

    fn cancel_step(&self, instance_id: &str, step_id: &str) -> Result<bool, ExecutorError> {
        let control = self
            .control(instance_id)
            .ok_or_else(|| ExecutorError::RunNotActive(instance_id.to_string()))?;
        let Some(token) = control.steps.get(step_id).map(|t| t.value().clone()) else {
            return Ok(false);
        };
        tracing::info!(instance_id, step_id, "cancelling step");
        token.cancel();
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Engine faults. Step failures are not errors: they end the run FAILED and
/// are reported through the returned `ExecutionResult`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A status change was not allowed by the state machine.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The persisted context snapshot could not be restored.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("instance '{instance_id}' belongs to workflow '{actual}', not '{expected}'")]
    DefinitionMismatch {
        instance_id: String,
        expected: String,
        actual: String,
    },

    #[error("instance '{instance_id}' is {actual}, expected {expected}")]
    UnexpectedStatus {
        instance_id: String,
        expected: WorkflowStatus,
        actual: WorkflowStatus,
    },

    #[error("workflow instance '{0}' is already running")]
    AlreadyRunning(String),

    /// Pause or step cancellation for a run this executor is not driving.
    #[error("workflow instance '{0}' is not running in this executor")]
    RunNotActive(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use tokio::sync::broadcast;

    use sagaflow_types::error::RepositoryError;

    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::retry::RetryPolicy;
    use crate::workflow::test_support::{Journal, TestStep};

    type TestExecutor = DagExecutor<InMemoryWorkflowRepository>;

    fn executor() -> TestExecutor {
        executor_with(ExecutorConfig::default())
    }

    fn executor_with(config: ExecutorConfig) -> TestExecutor {
        DagExecutor::new(InMemoryWorkflowRepository::new(), EventBus::new(256), config)
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<WorkflowEvent>,
        predicate: impl Fn(&WorkflowEvent) -> bool,
    ) -> WorkflowEvent {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    }

    fn step_started(id: &'static str) -> impl Fn(&WorkflowEvent) -> bool {
        move |event| matches!(event, WorkflowEvent::StepStarted { step_id, .. } if step_id == id)
    }

    #[test]
    fn config_from_settings() {
        let settings = ExecutorSettings {
            max_parallel_steps: 0,
            default_step_timeout_secs: 10,
            default_global_timeout_secs: 60,
        };
        let config = ExecutorConfig::from(&settings);
        assert_eq!(config.max_parallel_steps, 1);
        assert_eq!(config.default_step_timeout, Duration::from_secs(10));
        assert_eq!(config.default_global_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn linear_chain_runs_in_order_and_writes_outputs() {
        let journal = Journal::default();
        let a = TestStep::new("a").output("a_out", json!(1)).journal(&journal);
        let a_attempts = a.attempt_counter();
        let def = WorkflowDefinition::builder("linear")
            .add_step(a)
            .add_step_after(
                TestStep::new("b").requires("a_out").output("b_out", json!(2)).journal(&journal),
                &["a"],
            )
            .add_step_after(
                TestStep::new("c").requires("b_out").output("c_out", json!(3)).journal(&journal),
                &["b"],
            )
            .build()
            .unwrap();

        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert_eq!(result.instance.completed_step_ids, vec!["a", "b", "c"]);
        assert_eq!(result.context.get_value("a_out"), Some(&json!(1)));
        assert_eq!(result.context.get_value("c_out"), Some(&json!(3)));
        assert_eq!(a_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            journal.entries(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
        assert!(result.instance.completed_at.is_some());
    }

    #[tokio::test]
    async fn diamond_respects_dependencies() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("diamond")
            .add_step(TestStep::new("a").journal(&journal))
            .add_step_after(TestStep::new("b").journal(&journal), &["a"])
            .add_step_after(TestStep::new("c").journal(&journal), &["a"])
            .add_step_after(TestStep::new("d").journal(&journal), &["b", "c"])
            .build()
            .unwrap();

        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();
        assert_eq!(result.status(), WorkflowStatus::Completed);

        let pos = |entry: &str| journal.position(entry).unwrap();
        assert!(pos("end:a") < pos("start:b"));
        assert!(pos("end:a") < pos("start:c"));
        assert!(pos("end:b") < pos("start:d"));
        assert!(pos("end:c") < pos("start:d"));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_steps_run_concurrently() {
        let def = WorkflowDefinition::builder("fan-out")
            .add_step(TestStep::new("a").delay(Duration::from_secs(1)))
            .add_step(TestStep::new("b").delay(Duration::from_secs(1)))
            .add_step(TestStep::new("c").delay(Duration::from_secs(1)))
            .build()
            .unwrap();

        let start = Instant::now();
        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();
        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_bounds_concurrency() {
        let def = WorkflowDefinition::builder("fan-out")
            .add_step(TestStep::new("a").delay(Duration::from_secs(1)))
            .add_step(TestStep::new("b").delay(Duration::from_secs(1)))
            .add_step(TestStep::new("c").delay(Duration::from_secs(1)))
            .build()
            .unwrap();
        let exec = executor_with(ExecutorConfig {
            max_parallel_steps: 1,
            ..ExecutorConfig::default()
        });

        let start = Instant::now();
        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();
        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn sequential_mode_runs_one_step_at_a_time() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("sequential")
            .execution_mode(ExecutionMode::Sequential)
            .add_step(TestStep::new("a").journal(&journal))
            .add_step(TestStep::new("b").journal(&journal))
            .add_step(TestStep::new("c").journal(&journal))
            .build()
            .unwrap();

        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();
        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert_eq!(
            journal.entries(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
    }

    #[tokio::test]
    async fn skipped_steps_satisfy_dependants() {
        let def = WorkflowDefinition::builder("skips")
            .add_step(TestStep::new("a").skip().output("a_out", json!("never")))
            .add_step_after(TestStep::new("b").output("b_out", json!("ran")), &["a"])
            .add_step_after(TestStep::new("c").skip_when_missing("a_out"), &["b"])
            .build()
            .unwrap();
        let exec = executor();
        let mut rx = exec.event_bus().subscribe();

        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert_eq!(result.instance.step_status("a"), Some(StepStatus::Skipped));
        assert_eq!(result.instance.step_status("b"), Some(StepStatus::Completed));
        assert_eq!(result.instance.step_status("c"), Some(StepStatus::Skipped));
        assert!(!result.context.contains_key("a_out"));
        assert_eq!(result.instance.completed_step_ids, vec!["b"]);

        let skipped: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepSkipped { step_id, .. } => Some(step_id),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_and_failure_reported_once() {
        let step = TestStep::new("flaky")
            .always_fail()
            .retry(RetryPolicy::fixed(3, Duration::from_secs(1)));
        let attempts = step.attempt_counter();
        let def = WorkflowDefinition::builder("retry")
            .compensation_strategy(CompensationStrategy::None)
            .add_step(step)
            .build()
            .unwrap();
        let exec = executor();
        let mut rx = exec.event_bus().subscribe();

        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(result.instance.failure_reason.as_deref().unwrap().contains("flaky"));
        assert_eq!(result.instance.execution("flaky").unwrap().attempt, 3);

        let events = drain(&mut rx);
        let failed: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepFailed { attempts, .. } => Some(*attempts),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![3]);
        let retried = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepRetried { .. }))
            .count();
        assert_eq!(retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_in_flight_siblings() {
        let def = WorkflowDefinition::builder("siblings")
            .compensation_strategy(CompensationStrategy::None)
            .add_step(TestStep::new("slow").delay(Duration::from_secs(60)))
            .add_step(
                TestStep::new("bad")
                    .delay(Duration::from_secs(1))
                    .permanent_failure(),
            )
            .add_step_after(TestStep::new("after"), &["slow"])
            .build()
            .unwrap();

        let start = Instant::now();
        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert_eq!(result.instance.step_status("bad"), Some(StepStatus::Failed));
        assert_eq!(result.instance.step_status("slow"), Some(StepStatus::Cancelled));
        assert_eq!(result.instance.step_status("after"), None);
        assert!(
            result
                .instance
                .failure_reason
                .as_deref()
                .unwrap()
                .starts_with("step 'bad' failed")
        );
    }

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("saga")
            .add_step(TestStep::new("a").compensated().journal(&journal))
            .add_step_after(TestStep::new("b").compensated().journal(&journal), &["a"])
            .add_step_after(TestStep::new("c").compensated().journal(&journal), &["b"])
            .add_step_after(TestStep::new("d").permanent_failure().journal(&journal), &["c"])
            .build()
            .unwrap();
        let exec = executor();
        let mut rx = exec.event_bus().subscribe();

        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Compensated);
        assert_eq!(journal.with_prefix("compensate:"), vec!["c", "b", "a"]);
        for id in ["a", "b", "c"] {
            assert_eq!(result.instance.step_status(id), Some(StepStatus::Compensated));
        }
        assert_eq!(result.instance.step_status("d"), Some(StepStatus::Failed));
        assert!(journal.position("error:d").is_some());

        let started = drain(&mut rx).into_iter().find_map(|e| match e {
            WorkflowEvent::CompensationStarted { steps, .. } => Some(steps),
            _ => None,
        });
        assert_eq!(started.unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn failed_compensation_does_not_stop_the_sweep() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("saga")
            .add_step(TestStep::new("a").compensated().journal(&journal))
            .add_step_after(TestStep::new("b").failing_compensation().journal(&journal), &["a"])
            .add_step_after(TestStep::new("c").permanent_failure(), &["b"])
            .build()
            .unwrap();

        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Compensated);
        assert_eq!(journal.with_prefix("compensate:"), vec!["b", "a"]);
        assert_eq!(result.instance.step_status("a"), Some(StepStatus::Compensated));
        let b = result.instance.execution("b").unwrap();
        assert_eq!(b.status, StepStatus::CompensationFailed);
        assert!(b.compensation_error.is_some());
    }

    #[tokio::test]
    async fn fan_in_sees_all_upstream_outputs() {
        let mut ctx = WorkflowContext::new();
        ctx.put("user", &"ada").unwrap();
        let def = WorkflowDefinition::builder("fan-in")
            .add_step(TestStep::new("x").requires("user").output("x", json!(1)))
            .add_step(TestStep::new("y").output("y", json!(2)))
            .add_step_after(
                TestStep::new("join").requires("x").requires("y"),
                &["x", "y"],
            )
            .build()
            .unwrap();

        let result = executor().execute(&def, ctx).await.unwrap();
        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert_eq!(result.context.get_value("user"), Some(&json!("ada")));
        assert_eq!(result.instance.completed_step_ids.last().map(String::as_str), Some("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_waits_for_the_slowest_branch() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("slow-branch")
            .add_step(TestStep::new("a").journal(&journal))
            .add_step_after(
                TestStep::new("b").delay(Duration::from_secs(1)).journal(&journal),
                &["a"],
            )
            .add_step_after(
                TestStep::new("c").delay(Duration::from_secs(11)).journal(&journal),
                &["a"],
            )
            .add_step_after(TestStep::new("d").journal(&journal), &["b", "c"])
            .build()
            .unwrap();

        let start = Instant::now();
        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Completed);
        assert!(journal.position("end:b") < journal.position("end:c"));
        assert!(journal.position("end:c") < journal.position("start:d"));
        assert!(start.elapsed() >= Duration::from_secs(11));
        assert!(start.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn global_timeout_aborts_the_run() {
        let def = WorkflowDefinition::builder("deadline")
            .compensation_strategy(CompensationStrategy::None)
            .global_timeout(Duration::from_secs(1))
            .add_step(TestStep::new("slow").delay(Duration::from_secs(5)))
            .build()
            .unwrap();

        let start = Instant::now();
        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert!(result.instance.failure_reason.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.instance.step_status("slow"), Some(StepStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_drains_in_flight_steps_and_resume_continues() {
        let a = TestStep::new("a").delay(Duration::from_secs(1));
        let b = TestStep::new("b").delay(Duration::from_secs(1));
        let c = TestStep::new("c").delay(Duration::from_secs(1));
        let counters = [a.attempt_counter(), b.attempt_counter(), c.attempt_counter()];
        let def = Arc::new(
            WorkflowDefinition::builder("pausable")
                .add_step(a)
                .add_step_after(b, &["a"])
                .add_step_after(c, &["b"])
                .build()
                .unwrap(),
        );
        let exec = Arc::new(executor());
        let mut rx = exec.event_bus().subscribe();
        let instance = exec.submit(&def, WorkflowContext::new()).await.unwrap();
        let id = instance.instance_id.clone();

        let handle = {
            let (exec, def, id) = (Arc::clone(&exec), Arc::clone(&def), id.clone());
            tokio::spawn(async move { exec.start(&def, &id).await })
        };
        wait_for(&mut rx, step_started("b")).await;
        exec.pause(&id).unwrap();

        let paused = handle.await.unwrap().unwrap();
        assert_eq!(paused.status(), WorkflowStatus::Paused);
        assert_eq!(paused.instance.step_status("b"), Some(StepStatus::Completed));
        assert_eq!(paused.instance.step_status("c"), None);
        assert!(!exec.is_active(&id));

        let resumed = exec.resume(&def, &id).await.unwrap();
        assert_eq!(resumed.status(), WorkflowStatus::Completed);
        assert_eq!(resumed.instance.completed_step_ids, vec!["a", "b", "c"]);
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_step_fails_the_run() {
        let def = Arc::new(
            WorkflowDefinition::builder("cancel-step")
                .compensation_strategy(CompensationStrategy::None)
                .add_step(TestStep::new("slow").delay(Duration::from_secs(60)))
                .build()
                .unwrap(),
        );
        let exec = Arc::new(executor());
        let mut rx = exec.event_bus().subscribe();
        let id = exec
            .submit(&def, WorkflowContext::new())
            .await
            .unwrap()
            .instance_id;

        let handle = {
            let (exec, def, id) = (Arc::clone(&exec), Arc::clone(&def), id.clone());
            tokio::spawn(async move { exec.start(&def, &id).await })
        };
        wait_for(&mut rx, step_started("slow")).await;
        assert!(!exec.cancel_step(&id, "ghost").unwrap());
        assert!(exec.cancel_step(&id, "slow").unwrap());

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status(), WorkflowStatus::Failed);
        let slow = result.instance.execution("slow").unwrap();
        assert_eq!(slow.status, StepStatus::Failed);
        assert_eq!(slow.error.as_deref(), Some("step cancelled"));

        let err = exec.cancel_step(&id, "slow").unwrap_err();
        assert!(matches!(err, ExecutorError::RunNotActive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_an_active_run_skips_compensation() {
        let journal = Journal::default();
        let def = Arc::new(
            WorkflowDefinition::builder("cancel-run")
                .add_step(TestStep::new("a").compensated().journal(&journal))
                .add_step_after(TestStep::new("b").delay(Duration::from_secs(60)), &["a"])
                .build()
                .unwrap(),
        );
        let exec = Arc::new(executor());
        let mut rx = exec.event_bus().subscribe();
        let id = exec
            .submit(&def, WorkflowContext::new())
            .await
            .unwrap()
            .instance_id;

        let handle = {
            let (exec, def, id) = (Arc::clone(&exec), Arc::clone(&def), id.clone());
            tokio::spawn(async move { exec.start(&def, &id).await })
        };
        wait_for(&mut rx, step_started("b")).await;
        exec.cancel(&id).await.unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status(), WorkflowStatus::Cancelled);
        assert_eq!(result.instance.step_status("a"), Some(StepStatus::Completed));
        assert_eq!(result.instance.step_status("b"), Some(StepStatus::Cancelled));
        assert!(journal.with_prefix("compensate:").is_empty());
        wait_for(&mut rx, |e| matches!(e, WorkflowEvent::WorkflowCancelled { .. })).await;
    }

    #[tokio::test]
    async fn cancelling_a_pending_instance() {
        let def = WorkflowDefinition::builder("pending")
            .add_step(TestStep::new("a"))
            .build()
            .unwrap();
        let exec = executor();
        let id = exec
            .submit(&def, WorkflowContext::new())
            .await
            .unwrap()
            .instance_id;

        exec.cancel(&id).await.unwrap();
        let stored = exec.repo().find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
        assert_eq!(stored.failure_reason.as_deref(), Some("cancelled by user"));

        let err = exec.cancel(&id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::State(_)));
    }

    #[tokio::test]
    async fn start_requires_a_pending_instance() {
        let def = WorkflowDefinition::builder("once")
            .add_step(TestStep::new("a"))
            .build()
            .unwrap();
        let exec = executor();
        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();

        let err = exec.start(&def, result.instance_id()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::UnexpectedStatus {
                expected: WorkflowStatus::Pending,
                actual: WorkflowStatus::Completed,
                ..
            }
        ));
        let err = exec.resume(&def, result.instance_id()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnexpectedStatus { .. }));
    }

    #[tokio::test]
    async fn start_rejects_another_definition() {
        let first = WorkflowDefinition::builder("first")
            .add_step(TestStep::new("a"))
            .build()
            .unwrap();
        let second = WorkflowDefinition::builder("second")
            .add_step(TestStep::new("a"))
            .build()
            .unwrap();
        let exec = executor();
        let id = exec
            .submit(&first, WorkflowContext::new())
            .await
            .unwrap()
            .instance_id;

        let err = exec.start(&second, &id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::DefinitionMismatch { .. }));

        let err = exec.start(&first, "missing").await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Checkpoint(CheckpointError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_context_value_is_not_retried() {
        let step = TestStep::new("needs-profile")
            .requires("profile")
            .retry(RetryPolicy::fixed(3, Duration::ZERO));
        let executed = step.attempt_counter();
        let def = WorkflowDefinition::builder("missing")
            .compensation_strategy(CompensationStrategy::None)
            .add_step(step)
            .build()
            .unwrap();

        let result = executor().execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        let exec = result.instance.execution("needs-profile").unwrap();
        assert_eq!(exec.attempt, 1);
        assert!(exec.error.as_deref().unwrap().contains("profile"));
    }

    #[tokio::test]
    async fn persisted_snapshot_matches_result() {
        let def = WorkflowDefinition::builder("durable")
            .add_step(TestStep::new("a").output("a", json!({"n": 1})))
            .add_step_after(TestStep::new("b"), &["a"])
            .build()
            .unwrap();
        let exec = executor();

        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();
        let stored = exec
            .repo()
            .find_by_id(result.instance_id())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored, result.instance);
        assert_eq!(stored.context, json!({"a": {"n": 1}}));
    }

    #[tokio::test]
    async fn panicking_step_fails_like_any_other_step() {
        let journal = Journal::default();
        let def = WorkflowDefinition::builder("panics")
            .compensation_strategy(CompensationStrategy::None)
            .add_step(TestStep::new("ok").journal(&journal))
            .add_step_after(TestStep::new("buggy").panics().journal(&journal), &["ok"])
            .build()
            .unwrap();
        let exec = executor();
        let mut rx = exec.event_bus().subscribe();

        let result = exec.execute(&def, WorkflowContext::new()).await.unwrap();

        assert_eq!(result.status(), WorkflowStatus::Failed);
        assert_eq!(result.instance.step_status("buggy"), Some(StepStatus::Failed));
        assert!(result.instance.failure_reason.as_deref().unwrap().contains("buggy"));
        assert!(journal.entries().contains(&"error:buggy".to_string()));
        assert!(
            result
                .instance
                .step_executions
                .values()
                .all(|e| e.status != StepStatus::Running)
        );

        let events = drain(&mut rx);
        let failed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepFailed { step_id, .. } => Some(step_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec!["buggy"]);
    }

    /// Repository whose next `find_by_id` blocks until released.
    #[derive(Clone, Default)]
    struct GatedRepo {
        inner: InMemoryWorkflowRepository,
        armed: Arc<std::sync::atomic::AtomicBool>,
        held: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    impl GatedRepo {
        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    impl WorkflowInstanceRepository for GatedRepo {
        async fn save(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance, RepositoryError> {
            self.inner.save(instance).await
        }

        async fn find_by_id(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
            }
            self.inner.find_by_id(instance_id).await
        }

        async fn find_by_workflow_name(&self, workflow_name: &str) -> Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner.find_by_workflow_name(workflow_name).await
        }

        async fn find_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner.find_by_status(status).await
        }

        async fn find_by_workflow_name_and_status(
            &self,
            workflow_name: &str,
            status: WorkflowStatus,
        ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner
                .find_by_workflow_name_and_status(workflow_name, status)
                .await
        }

        async fn delete_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
            self.inner.delete_by_id(instance_id).await
        }

        async fn exists_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
            self.inner.exists_by_id(instance_id).await
        }

        async fn count(&self) -> Result<u64, RepositoryError> {
            self.inner.count().await
        }

        async fn count_by_status(&self, status: WorkflowStatus) -> Result<u64, RepositoryError> {
            self.inner.count_by_status(status).await
        }
    }

    #[tokio::test]
    async fn concurrent_starts_run_the_instance_once() {
        let step = TestStep::new("a");
        let executed = step.attempt_counter();
        let def = WorkflowDefinition::builder("once")
            .add_step(step)
            .build()
            .unwrap();
        let repo = GatedRepo::default();
        let exec = DagExecutor::new(repo.clone(), EventBus::new(256), ExecutorConfig::default());
        let id = exec
            .submit(&def, WorkflowContext::new())
            .await
            .unwrap()
            .instance_id;
        repo.arm();

        // The first start stalls while loading; the second arrives meanwhile.
        let first = exec.start(&def, &id);
        let second = async {
            repo.held.notified().await;
            let result = exec.start(&def, &id).await;
            repo.release.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().status(), WorkflowStatus::Completed);
        assert!(matches!(second, Err(ExecutorError::AlreadyRunning(_))));
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }
}
