//! Shared domain types for sagaflow.
//!
//! This crate contains the data model shared by the engine, its storage
//! adapters and the CLI: workflow instances and their status machine, step
//! execution records, lifecycle events, configuration and error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
