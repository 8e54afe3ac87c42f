//! Workflow definitions: an immutable, validated DAG of steps.
//!
//! Definitions are assembled with `WorkflowDefinition::builder` and frozen by
//! `build()`, which rejects every structural problem up front (empty name, no
//! steps, duplicate IDs or output keys, unknown dependencies, cycles). The
//! executor can therefore assume a well-formed graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sagaflow_types::workflow::{CompensationStrategy, ExecutionMode};
use thiserror::Error;

use super::dag;
use super::step::{SharedStep, Step};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps share an ID.
    #[error("duplicate step ID '{0}'")]
    DuplicateStepId(String),

    /// Two steps write the same context key.
    #[error("duplicate output key '{key}' (steps '{first}' and '{second}')")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// A step together with the IDs of the steps it depends on.
#[derive(Clone)]
pub struct StepNode {
    step: SharedStep,
    depends_on: Vec<String>,
}

impl StepNode {
    pub fn new(step: SharedStep, depends_on: Vec<String>) -> Self {
        Self { step, depends_on }
    }

    pub fn id(&self) -> &str {
        self.step.id()
    }

    pub fn step(&self) -> &SharedStep {
        &self.step
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.step.id())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// An immutable, validated workflow.
///
/// Steps are kept in declaration order, which is also the dispatch order for
/// sequential execution and the tie-break order for parallel execution.
pub struct WorkflowDefinition {
    name: String,
    description: String,
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
    execution_mode: ExecutionMode,
    compensation_strategy: CompensationStrategy,
    global_timeout: Option<Duration>,
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn compensation_strategy(&self) -> CompensationStrategy {
        self.compensation_strategy
    }

    /// Declared global timeout. `None` means the executor default applies.
    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.index.get(step_id).map(|&i| &self.nodes[i])
    }

    pub fn step(&self, step_id: &str) -> Option<&SharedStep> {
        self.node(step_id).map(StepNode::step)
    }

    /// Direct dependencies of a step (empty for unknown IDs).
    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.node(step_id).map(StepNode::depends_on).unwrap_or(&[])
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(StepNode::id)
    }

    pub fn contains_step(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Group steps into parallel waves: every step in wave `n` depends only
    /// on steps in earlier waves.
    pub fn execution_plan(&self) -> Vec<Vec<&str>> {
        // Acyclicity was verified by build().
        dag::build_execution_plan(&self.nodes).unwrap_or_default()
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("execution_mode", &self.execution_mode)
            .field("compensation_strategy", &self.compensation_strategy)
            .field("global_timeout", &self.global_timeout)
            .field("nodes", &self.nodes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`WorkflowDefinition`].
///
/// A step may only depend on steps added before it; `build()` enforces this.
pub struct WorkflowDefinitionBuilder {
    name: String,
    description: String,
    nodes: Vec<StepNode>,
    execution_mode: ExecutionMode,
    compensation_strategy: CompensationStrategy,
    global_timeout: Option<Duration>,
}

impl WorkflowDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            execution_mode: ExecutionMode::default(),
            compensation_strategy: CompensationStrategy::default(),
            global_timeout: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn compensation_strategy(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation_strategy = strategy;
        self
    }

    pub fn global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    /// Register a root step (no prerequisites).
    pub fn add_step<S: Step>(self, step: S) -> Self {
        self.add_shared_step(Arc::new(step), Vec::new())
    }

    /// Register a step that runs only after all of `depends_on` have
    /// completed or been skipped.
    pub fn add_step_after<S: Step>(self, step: S, depends_on: &[&str]) -> Self {
        let deps = depends_on.iter().map(|d| d.to_string()).collect();
        self.add_shared_step(Arc::new(step), deps)
    }

    /// Register an already type-erased step.
    pub fn add_shared_step(mut self, step: SharedStep, depends_on: Vec<String>) -> Self {
        self.nodes.push(StepNode::new(step, depends_on));
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        validate_name(&self.name)?;

        if self.nodes.is_empty() {
            return Err(WorkflowError::ValidationError(
                "workflow must have at least one step".to_string(),
            ));
        }

        if self.global_timeout == Some(Duration::ZERO) {
            return Err(WorkflowError::ValidationError(
                "global timeout must be greater than zero".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id().is_empty() {
                return Err(WorkflowError::ValidationError(
                    "step ID must not be empty".to_string(),
                ));
            }
            if index.insert(node.id().to_string(), i).is_some() {
                return Err(WorkflowError::DuplicateStepId(node.id().to_string()));
            }
        }

        let mut output_keys: HashMap<&str, &str> = HashMap::new();
        for node in &self.nodes {
            let Some(key) = node.step().output_key() else {
                continue;
            };
            if let Some(first) = output_keys.insert(key, node.id()) {
                return Err(WorkflowError::DuplicateOutputKey {
                    key: key.to_string(),
                    first: first.to_string(),
                    second: node.id().to_string(),
                });
            }
        }

        for node in &self.nodes {
            let mut seen = HashSet::new();
            for dep in node.depends_on() {
                if !seen.insert(dep.as_str()) {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' lists dependency '{}' more than once",
                        node.id(),
                        dep
                    )));
                }
            }
        }

        for (i, node) in self.nodes.iter().enumerate() {
            for dep in node.depends_on() {
                match index.get(dep.as_str()) {
                    Some(&at) if at < i => {}
                    Some(_) => {
                        return Err(WorkflowError::UnknownDependency(format!(
                            "step '{}' depends on '{dep}', which is not added before it",
                            node.id()
                        )));
                    }
                    None => {
                        return Err(WorkflowError::UnknownDependency(format!(
                            "step '{}' depends on unknown step '{dep}'",
                            node.id()
                        )));
                    }
                }
            }
        }

        // Cycles cannot survive the ordering check; kept as a graph-level guard.
        dag::validate_dag(&self.nodes)?;

        Ok(WorkflowDefinition {
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            index,
            execution_mode: self.execution_mode,
            compensation_strategy: self.compensation_strategy,
            global_timeout: self.global_timeout,
        })
    }
}

/// Name format: non-empty, alphanumeric plus hyphens and underscores.
fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{name}' contains invalid characters (only alphanumeric, hyphens and underscores allowed)"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
