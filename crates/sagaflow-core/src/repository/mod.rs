//! Repository trait definitions (ports) and the in-memory adapter.
//!
//! These traits define the storage interface that the infrastructure layer
//! (sagaflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::WorkflowInstanceRepository;
