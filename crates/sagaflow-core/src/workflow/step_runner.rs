//! Per-step execution path: worker permit, hooks, attempts, timeout, retry.
//!
//! A `StepTask` is spawned on the executor's `JoinSet` for each dispatched
//! step. It owns everything it needs (the step, an immutable context
//! snapshot, its cancellation token) and reports a `StepResult` back to the
//! run loop, which is the only writer of the instance and context.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::event::WorkflowEvent;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;

use super::context::WorkflowContext;
use super::step::{SharedStep, StepError, StepResult};

/// What a finished step task hands back to the run loop.
#[derive(Debug)]
pub struct StepTaskOutput {
    pub step_id: String,
    pub result: StepResult<Value>,
}

/// A dispatched step, ready to be spawned.
pub struct StepTask {
    pub instance_id: String,
    pub step: SharedStep,
    pub context: Arc<WorkflowContext>,
    pub token: CancellationToken,
    pub permits: Arc<Semaphore>,
    pub event_bus: EventBus,
    pub default_timeout: Duration,
}

impl StepTask {
    /// Run the step through all of its attempts.
    ///
    /// Cancellation is observed while waiting for a worker permit, during
    /// every attempt and during backoff sleeps. The step future is dropped at
    /// its next await point.
    pub async fn run(self) -> StepTaskOutput {
        let step_id = self.step.id().to_string();
        let started_at = Utc::now();

        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                return self.finish(step_id, started_at, Err(StepError::Cancelled), 0);
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let error = StepError::permanent("worker pool closed");
                    return self.finish(step_id, started_at, Err(error), 0);
                }
            },
        };

        self.step.on_before_execute(&self.context);
        self.event_bus.publish(WorkflowEvent::StepStarted {
            instance_id: self.instance_id.clone(),
            step_id: step_id.clone(),
            step_name: self.step.name().to_string(),
        });

        let policy = self.step.retry_policy();
        let timeout = self.step.timeout().unwrap_or(self.default_timeout);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            tracing::debug!(
                instance_id = %self.instance_id,
                step_id = %step_id,
                attempt,
                "running step attempt"
            );

            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(StepError::Cancelled),
                result = tokio::time::timeout(timeout, self.step.execute_boxed(&self.context)) => {
                    result.unwrap_or(Err(StepError::Timeout(timeout)))
                }
            };

            match outcome {
                Ok(value) => return self.finish(step_id, started_at, Ok(value), attempt),
                Err(error) if error.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        step_id = %step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    self.event_bus.publish(WorkflowEvent::StepRetried {
                        instance_id: self.instance_id.clone(),
                        step_id: step_id.clone(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    });

                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {
                            return self.finish(step_id, started_at, Err(StepError::Cancelled), attempt);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    if error != StepError::Cancelled {
                        self.step.on_error(&error, &self.context);
                    }
                    return self.finish(step_id, started_at, Err(error), attempt);
                }
            }
        }
    }

    fn finish(
        &self,
        step_id: String,
        started_at: chrono::DateTime<Utc>,
        outcome: Result<Value, StepError>,
        attempts: u32,
    ) -> StepTaskOutput {
        let completed_at = Utc::now();
        let result = match outcome {
            Ok(value) => StepResult::Success {
                value,
                started_at,
                completed_at,
                attempts,
            },
            Err(error) => StepResult::Failure {
                error,
                started_at,
                completed_at,
                attempts,
            },
        };
        StepTaskOutput { step_id, result }
    }
}
