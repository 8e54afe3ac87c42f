//! DAG validation, parallel wave computation and the readiness frontier.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles, and depth-based grouping produces parallel execution
//! waves. At run time the executor does not walk waves; it recomputes the
//! frontier of ready steps from the instance's execution records after every
//! completion or skip.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use sagaflow_types::workflow::WorkflowInstance;

use super::definition::{StepNode, WorkflowDefinition, WorkflowError};

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build a graph with an edge from each dependency to its dependant.
fn build_graph(nodes: &[StepNode]) -> Result<DiGraph<&str, ()>, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::with_capacity(nodes.len(), nodes.len());
    let indices: HashMap<&str, NodeIndex> = nodes
        .iter()
        .map(|node| (node.id(), graph.add_node(node.id())))
        .collect();

    for node in nodes {
        let to = indices[node.id()];
        for dep in node.depends_on() {
            let from = indices.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    node.id(),
                    dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    Ok(graph)
}

/// Topologically sort the graph, reporting a step on the cycle if there is one.
fn sorted<'a>(graph: &DiGraph<&'a str, ()>) -> Result<Vec<&'a str>, WorkflowError> {
    let order = toposort(graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;
    Ok(order.into_iter().map(|idx| graph[idx]).collect())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that the nodes form a DAG (no cycles, all references exist).
///
/// Returns the step IDs in a topological order.
pub fn validate_dag(nodes: &[StepNode]) -> Result<Vec<&str>, WorkflowError> {
    let graph = build_graph(nodes)?;
    sorted(&graph)
}

// ---------------------------------------------------------------------------
// Execution plan (wave computation)
// ---------------------------------------------------------------------------

/// Group step IDs into parallel waves.
///
/// A root step has depth 0; every other step has depth one more than its
/// deepest dependency. Within a wave, steps keep declaration order.
pub fn build_execution_plan(nodes: &[StepNode]) -> Result<Vec<Vec<&str>>, WorkflowError> {
    if nodes.is_empty() {
        return Ok(vec![]);
    }

    let order = validate_dag(nodes)?;
    let by_id: HashMap<&str, &StepNode> = nodes.iter().map(|n| (n.id(), n)).collect();

    let mut depths: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for step_id in order {
        let depth = by_id[step_id]
            .depends_on()
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&str>> = vec![vec![]; max_depth + 1];
    for node in nodes {
        waves[depths[node.id()]].push(node.id());
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// Readiness frontier
// ---------------------------------------------------------------------------

/// Steps that may be dispatched now, in declaration order.
///
/// A step is ready when it has no execution record yet and every dependency
/// is COMPLETED or SKIPPED.
pub fn ready_steps<'d>(
    definition: &'d WorkflowDefinition,
    instance: &WorkflowInstance,
) -> Vec<&'d StepNode> {
    definition
        .nodes()
        .iter()
        .filter(|node| !instance.step_executions.contains_key(node.id()))
        .filter(|node| {
            node.depends_on()
                .iter()
                .all(|dep| instance.is_step_satisfied(dep))
        })
        .collect()
}

/// Whether every step of the definition is COMPLETED or SKIPPED.
pub fn all_steps_satisfied(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> bool {
    definition
        .step_ids()
        .all(|step_id| instance.is_step_satisfied(step_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
