//! Workflow instance repository trait definition.
//!
//! Defines the persistence port for workflow instance snapshots. The engine
//! saves whole snapshots and never deletes them; `delete_by_id` exists for
//! operators. The infrastructure layer (sagaflow-infra) implements this trait
//! with SQLite persistence; `memory::InMemoryWorkflowRepository` is the
//! in-process adapter.

use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{WorkflowInstance, WorkflowStatus};

/// Repository trait for workflow instance persistence.
///
/// List queries return newest instances first.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowInstanceRepository: Send + Sync {
    /// Upsert an instance snapshot by ID. Returns the stored snapshot.
    fn save(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, RepositoryError>> + Send;

    fn find_by_id(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    fn find_by_workflow_name(
        &self,
        workflow_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    fn find_by_status(
        &self,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    fn find_by_workflow_name_and_status(
        &self,
        workflow_name: &str,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Delete an instance by ID. Returns `true` if it existed.
    fn delete_by_id(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn exists_by_id(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn count(&self) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn count_by_status(
        &self,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
