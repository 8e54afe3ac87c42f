//! Step abstraction: the unit of work scheduled by the executor.
//!
//! Follows the same pattern as the rest of the crate's pluggable seams:
//! 1. `Step` is the statically typed trait implementors write, with native
//!    async methods and associated `Input`/`Output` types.
//! 2. `StepDyn` is an object-safe companion with boxed futures and JSON-typed
//!    outputs, blanket-implemented for every `Step`.
//! 3. Definitions store `SharedStep = Arc<dyn StepDyn>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::{ContextError, WorkflowContext};
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors produced by a step attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Transient failure; retried per the step's policy.
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying will not fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Required context data missing or mistyped; never retried.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The attempt exceeded the step timeout; retried.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// The attempt was cancelled; never retried.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Failed(_) | StepError::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of running a step through all of its attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult<O> {
    Success {
        value: O,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        attempts: u32,
    },
    Failure {
        error: StepError,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        attempts: u32,
    },
}

impl<O> StepResult<O> {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            StepResult::Success { attempts, .. } | StepResult::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            StepResult::Success { started_at, .. } | StepResult::Failure { started_at, .. } => {
                *started_at
            }
        }
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        match self {
            StepResult::Success { completed_at, .. } | StepResult::Failure { completed_at, .. } => {
                *completed_at
            }
        }
    }

    /// Wall-clock duration between start and completion, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.completed_at() - self.started_at())
            .num_milliseconds()
            .max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A unit of work in a workflow.
///
/// Only `id`, `prepare_input` and `execute` are required. Defaults: the name
/// is the id, no output key, the executor's default timeout, a single attempt,
/// never skipped, no-op hooks and no compensation.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Step: Send + Sync + 'static {
    type Input: Send;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Unique identifier within a workflow definition.
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    /// Context key the output is written to on success.
    fn output_key(&self) -> Option<&str> {
        None
    }

    /// Per-attempt timeout. `None` uses the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Evaluated once when the step becomes ready. A skipped step satisfies
    /// its dependants but writes nothing.
    fn should_skip(&self, _ctx: &WorkflowContext) -> bool {
        false
    }

    /// Build the step input from the context. Runs before every attempt.
    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<Self::Input, StepError>;

    fn execute(
        &self,
        input: Self::Input,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<Self::Output, StepError>> + Send;

    fn on_before_execute(&self, _ctx: &WorkflowContext) {}

    fn on_after_execute(&self, _output: &Self::Output, _ctx: &WorkflowContext) {}

    /// Called once when the step fails for good (not on cancellation).
    fn on_error(&self, _error: &StepError, _ctx: &WorkflowContext) {}

    fn has_compensation(&self) -> bool {
        false
    }

    /// Undo the effects of a completed execution. Only called when
    /// `has_compensation` returns true.
    fn compensate(
        &self,
        _output: Self::Output,
        _ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Ok(()) }
    }
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// Undo action for a step whose output type is `O`.
///
/// Failures are logged by the executor and never retried.
pub trait CompensationAction<O>: Send + Sync + 'static {
    fn compensate(
        &self,
        output: O,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<(), StepError>> + Send;
}

/// A step paired with its compensation action.
///
/// Built with [`StepExt::with_compensation`].
pub struct Compensated<S, C> {
    step: S,
    action: C,
}

impl<S, C> Step for Compensated<S, C>
where
    S: Step,
    C: CompensationAction<S::Output>,
{
    type Input = S::Input;
    type Output = S::Output;

    fn id(&self) -> &str {
        self.step.id()
    }

    fn name(&self) -> &str {
        self.step.name()
    }

    fn output_key(&self) -> Option<&str> {
        self.step.output_key()
    }

    fn timeout(&self) -> Option<Duration> {
        self.step.timeout()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.step.retry_policy()
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        self.step.should_skip(ctx)
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<Self::Input, StepError> {
        self.step.prepare_input(ctx)
    }

    fn execute(
        &self,
        input: Self::Input,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<Self::Output, StepError>> + Send {
        self.step.execute(input, ctx)
    }

    fn on_before_execute(&self, ctx: &WorkflowContext) {
        self.step.on_before_execute(ctx)
    }

    fn on_after_execute(&self, output: &Self::Output, ctx: &WorkflowContext) {
        self.step.on_after_execute(output, ctx)
    }

    fn on_error(&self, error: &StepError, ctx: &WorkflowContext) {
        self.step.on_error(error, ctx)
    }

    fn has_compensation(&self) -> bool {
        true
    }

    fn compensate(
        &self,
        output: Self::Output,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        self.action.compensate(output, ctx)
    }
}

/// Combinators available on every [`Step`].
pub trait StepExt: Step + Sized {
    /// Attach a compensation action run when a later failure rolls the
    /// workflow back.
    fn with_compensation<C>(self, action: C) -> Compensated<Self, C>
    where
        C: CompensationAction<Self::Output>,
    {
        Compensated { step: self, action }
    }
}

impl<S: Step> StepExt for S {}

// ---------------------------------------------------------------------------
// Object-safe companion
// ---------------------------------------------------------------------------

/// Object-safe version of [`Step`] with boxed futures and JSON outputs.
///
/// This trait exists solely to enable dynamic dispatch (`dyn StepDyn`).
/// A blanket implementation is provided for all types implementing `Step`.
pub trait StepDyn: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn output_key(&self) -> Option<&str>;

    fn timeout(&self) -> Option<Duration>;

    fn retry_policy(&self) -> RetryPolicy;

    fn should_skip(&self, ctx: &WorkflowContext) -> bool;

    fn on_before_execute(&self, ctx: &WorkflowContext);

    fn on_error(&self, error: &StepError, ctx: &WorkflowContext);

    fn has_compensation(&self) -> bool;

    /// One attempt: `prepare_input`, `execute`, serialize the output, then
    /// `on_after_execute`.
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

    /// Deserialize a recorded output and run the compensation action.
    fn compensate_boxed<'a>(
        &'a self,
        output: Value,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;
}

/// Blanket implementation: any `Step` automatically implements `StepDyn`.
impl<T: Step> StepDyn for T {
    fn id(&self) -> &str {
        Step::id(self)
    }

    fn name(&self) -> &str {
        Step::name(self)
    }

    fn output_key(&self) -> Option<&str> {
        Step::output_key(self)
    }

    fn timeout(&self) -> Option<Duration> {
        Step::timeout(self)
    }

    fn retry_policy(&self) -> RetryPolicy {
        Step::retry_policy(self)
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        Step::should_skip(self, ctx)
    }

    fn on_before_execute(&self, ctx: &WorkflowContext) {
        Step::on_before_execute(self, ctx)
    }

    fn on_error(&self, error: &StepError, ctx: &WorkflowContext) {
        Step::on_error(self, error, ctx)
    }

    fn has_compensation(&self) -> bool {
        Step::has_compensation(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let input = self.prepare_input(ctx)?;
            let output = Step::execute(self, input, ctx).await?;
            let value = serde_json::to_value(&output).map_err(|e| {
                StepError::Permanent(format!("failed to serialize step output: {e}"))
            })?;
            Step::on_after_execute(self, &output, ctx);
            Ok(value)
        })
    }

    fn compensate_boxed<'a>(
        &'a self,
        output: Value,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>> {
        Box::pin(async move {
            if !Step::has_compensation(self) {
                return Ok(());
            }
            let output: T::Output = serde_json::from_value(output).map_err(|e| {
                StepError::Permanent(format!("failed to restore step output: {e}"))
            })?;
            Step::compensate(self, output, ctx).await
        })
    }
}

/// Type-erased step as stored in a workflow definition.
pub type SharedStep = Arc<dyn StepDyn>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
