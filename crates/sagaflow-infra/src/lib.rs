//! Infrastructure layer for Sagaflow.
//!
//! Contains the implementations of the ports defined in `sagaflow-core`:
//! SQLite persistence for workflow instances, plus configuration loading and
//! data-directory resolution.

pub mod config;
pub mod sqlite;
