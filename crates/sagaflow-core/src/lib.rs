//! Workflow engine and repository trait definitions for Sagaflow.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `sagaflow-types` -- never on
//! `sagaflow-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
