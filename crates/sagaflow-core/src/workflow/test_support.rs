//! Configurable step used by the engine's unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::context::WorkflowContext;
use super::retry::RetryPolicy;
use super::step::{Step, StepError};

/// Shared, ordered record of what test steps did.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Entries with the given prefix, prefix stripped.
    pub(crate) fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Compensation {
    Succeed,
    Fail,
}

pub(crate) struct TestStep {
    id: String,
    output_key: Option<String>,
    output: Value,
    delay: Duration,
    fail_times: u32,
    permanent: bool,
    panics: bool,
    skip: bool,
    skip_when_missing: Option<String>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    requires: Vec<String>,
    attempts: Arc<AtomicU32>,
    journal: Journal,
    compensation: Option<Compensation>,
}

impl TestStep {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            output_key: None,
            output: Value::String(format!("{id}-output")),
            delay: Duration::ZERO,
            fail_times: 0,
            permanent: false,
            panics: false,
            skip: false,
            skip_when_missing: None,
            retry: RetryPolicy::none(),
            timeout: None,
            requires: Vec::new(),
            attempts: Arc::new(AtomicU32::new(0)),
            journal: Journal::default(),
            compensation: None,
        }
    }

    pub(crate) fn output(mut self, key: &str, value: Value) -> Self {
        self.output_key = Some(key.to_string());
        self.output = value;
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn fail_times(mut self, n: u32) -> Self {
        self.fail_times = n;
        self
    }

    pub(crate) fn always_fail(self) -> Self {
        self.fail_times(u32::MAX)
    }

    pub(crate) fn permanent_failure(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub(crate) fn panics(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub(crate) fn skip_when_missing(mut self, key: &str) -> Self {
        self.skip_when_missing = Some(key.to_string());
        self
    }

    pub(crate) fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn requires(mut self, key: &str) -> Self {
        self.requires.push(key.to_string());
        self
    }

    pub(crate) fn journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub(crate) fn compensated(mut self) -> Self {
        self.compensation = Some(Compensation::Succeed);
        self
    }

    pub(crate) fn failing_compensation(mut self) -> Self {
        self.compensation = Some(Compensation::Fail);
        self
    }

    pub(crate) fn attempt_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

impl Step for TestStep {
    type Input = ();
    type Output = Value;

    fn id(&self) -> &str {
        &self.id
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn should_skip(&self, ctx: &WorkflowContext) -> bool {
        self.skip
            || self
                .skip_when_missing
                .as_deref()
                .is_some_and(|key| !ctx.contains_key(key))
    }

    fn prepare_input(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        for key in &self.requires {
            ctx.get_required::<Value>(key)?;
        }
        Ok(())
    }

    async fn execute(&self, _input: (), _ctx: &WorkflowContext) -> Result<Value, StepError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.push(format!("start:{}", self.id));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("{} hit a bug", self.id);
        }
        if self.permanent {
            return Err(StepError::permanent(format!("{} rejected the request", self.id)));
        }
        if attempt <= self.fail_times {
            return Err(StepError::failed(format!("attempt {attempt} failed")));
        }
        self.journal.push(format!("end:{}", self.id));
        Ok(self.output.clone())
    }

    fn on_error(&self, _error: &StepError, _ctx: &WorkflowContext) {
        self.journal.push(format!("error:{}", self.id));
    }

    fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    async fn compensate(&self, output: Value, _ctx: &WorkflowContext) -> Result<(), StepError> {
        self.journal.push(format!("compensate:{}", self.id));
        assert_eq!(output, self.output, "compensation receives the step's own output");
        match self.compensation {
            Some(Compensation::Fail) => Err(StepError::failed("compensation failed")),
            _ => Ok(()),
        }
    }
}
