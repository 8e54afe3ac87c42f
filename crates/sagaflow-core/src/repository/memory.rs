//! In-memory workflow instance repository backed by `DashMap`.
//!
//! Used by tests and by embedders that do not need durability. Cloning the
//! repository shares the underlying map.

use std::sync::Arc;

use dashmap::DashMap;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{WorkflowInstance, WorkflowStatus};

use super::workflow::WorkflowInstanceRepository;

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    instances: Arc<DashMap<String, WorkflowInstance>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect matching instances, newest first.
    fn collect_where(&self, predicate: impl Fn(&WorkflowInstance) -> bool) -> Vec<WorkflowInstance> {
        let mut found: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.instance_id.cmp(&a.instance_id))
        });
        found
    }
}

impl WorkflowInstanceRepository for InMemoryWorkflowRepository {
    async fn save(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance, RepositoryError> {
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(instance.clone())
    }

    async fn find_by_id(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_workflow_name(
        &self,
        workflow_name: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect_where(|i| i.workflow_name == workflow_name))
    }

    async fn find_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect_where(|i| i.status == status))
    }

    async fn find_by_workflow_name_and_status(
        &self,
        workflow_name: &str,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect_where(|i| i.workflow_name == workflow_name && i.status == status))
    }

    async fn delete_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.instances.remove(instance_id).is_some())
    }

    async fn exists_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.instances.contains_key(instance_id))
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        Ok(self.instances.len() as u64)
    }

    async fn count_by_status(&self, status: WorkflowStatus) -> Result<u64, RepositoryError> {
        Ok(self
            .instances
            .iter()
            .filter(|entry| entry.value().status == status)
            .count() as u64)
    }
}
