//! Workflow engine core: definitions, DAG execution, and durable checkpointing.
//!
//! This module contains the "brain" of the engine:
//! - `step` -- Step trait, typed and object-safe
//! - `definition` -- Builder and validation of step graphs
//! - `dag` -- Cycle detection, execution plans, readiness frontier
//! - `context` -- Shared key/value data flowing between steps
//! - `retry` -- Retry policies and backoff computation
//! - `state` -- Workflow state machine and health checks
//! - `checkpoint` -- Durable snapshots through the persistence port
//! - `executor` -- Frontier-driven parallel DAG executor
//! - `step_runner` -- Per-step attempts, timeouts and cancellation
//! - `compensation` -- Reverse-order saga rollback
//! - `registry` -- Name-indexed definition lookup

pub mod checkpoint;
pub mod compensation;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod state;
pub mod step;
pub mod step_runner;

#[cfg(test)]
pub(crate) mod test_support;
