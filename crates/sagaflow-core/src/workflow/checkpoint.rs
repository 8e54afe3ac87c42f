//! Durable checkpoint manager for workflow instance snapshots.
//!
//! Wraps a `WorkflowInstanceRepository` to give the executor a narrow API:
//! persist the current snapshot (with the latest context) and load one back
//! for start, resume or cancellation.

use sagaflow_types::workflow::WorkflowInstance;

use crate::repository::workflow::WorkflowInstanceRepository;

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists workflow instance snapshots through the persistence port.
///
/// Generic over `R: WorkflowInstanceRepository` so it works with any storage
/// backend (SQLite, in-memory). Every status change and step completion is
/// saved before the executor moves forward.
pub struct CheckpointManager<R: WorkflowInstanceRepository> {
    repo: R,
}

impl<R: WorkflowInstanceRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Copy the context into the snapshot and save it.
    pub async fn checkpoint(
        &self,
        instance: &mut WorkflowInstance,
        ctx: &WorkflowContext,
    ) -> Result<(), CheckpointError> {
        instance.context = ctx.to_json();
        self.save(instance).await
    }

    /// Save the snapshot as-is.
    pub async fn save(&self, instance: &WorkflowInstance) -> Result<(), CheckpointError> {
        self.repo
            .save(instance)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            instance_id = %instance.instance_id,
            status = %instance.status,
            completed = instance.completed_step_ids.len(),
            "checkpointed workflow instance"
        );
        Ok(())
    }

    /// Load a snapshot, failing if it does not exist.
    pub async fn load(&self, instance_id: &str) -> Result<WorkflowInstance, CheckpointError> {
        self.repo
            .find_by_id(instance_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or_else(|| CheckpointError::InstanceNotFound(instance_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;

    #[tokio::test]
    async fn checkpoint_copies_context_into_snapshot() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let mut instance = WorkflowInstance::new("wf", serde_json::json!({}));
        let mut ctx = WorkflowContext::new();
        ctx.put("profile", &"ada").unwrap();

        manager.checkpoint(&mut instance, &ctx).await.unwrap();

        let loaded = manager.load(&instance.instance_id).await.unwrap();
        assert_eq!(loaded.context, serde_json::json!({"profile": "ada"}));
    }

    #[tokio::test]
    async fn load_missing_instance() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let err = manager.load("nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::InstanceNotFound(ref id) if id == "nope"));
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));
    }
}
