//! SQLite workflow instance repository implementation.
//!
//! Implements `WorkflowInstanceRepository` from `sagaflow-core` using sqlx
//! with split read/write pools. Each instance is one row; the context, step
//! execution records and completion order are stored as JSON text columns.
//! Timestamps are fixed-width RFC 3339 strings so they sort lexically.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sagaflow_core::repository::workflow::WorkflowInstanceRepository;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::workflow::{StepExecution, WorkflowInstance, WorkflowStatus};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowInstanceRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_many(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn count_where(&self, sql: &str, binds: &[&str]) -> Result<u64, RepositoryError> {
        let mut query = sqlx::query_as::<_, (i64,)>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let (count,) = query
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(count.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "SELECT instance_id, workflow_name, status, context, step_executions, \
     completed_step_ids, failure_reason, created_at, started_at, completed_at, status_changed_at \
     FROM workflow_instances";

const NEWEST_FIRST: &str = "ORDER BY created_at DESC, instance_id DESC";

struct InstanceRow {
    instance_id: String,
    workflow_name: String,
    status: String,
    context: String,
    step_executions: String,
    completed_step_ids: String,
    failure_reason: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    status_changed_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            step_executions: row.try_get("step_executions")?,
            completed_step_ids: row.try_get("completed_step_ids")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            status_changed_at: row.try_get("status_changed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus = self.status.parse().map_err(RepositoryError::Query)?;

        let context: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        let step_executions: BTreeMap<String, StepExecution> =
            serde_json::from_str(&self.step_executions)
                .map_err(|e| RepositoryError::Query(format!("invalid step executions JSON: {e}")))?;
        let completed_step_ids: Vec<String> = serde_json::from_str(&self.completed_step_ids)
            .map_err(|e| RepositoryError::Query(format!("invalid completed step IDs JSON: {e}")))?;

        Ok(WorkflowInstance {
            instance_id: self.instance_id,
            workflow_name: self.workflow_name,
            status,
            context,
            step_executions,
            completed_step_ids,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            status_changed_at: parse_datetime(&self.status_changed_at)?,
            failure_reason: self.failure_reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// WorkflowInstanceRepository impl
// ---------------------------------------------------------------------------

impl WorkflowInstanceRepository for SqliteWorkflowRepository {
    async fn save(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_instances
               (instance_id, workflow_name, status, context, step_executions, completed_step_ids,
                failure_reason, created_at, started_at, completed_at, status_changed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 workflow_name = excluded.workflow_name,
                 status = excluded.status,
                 context = excluded.context,
                 step_executions = excluded.step_executions,
                 completed_step_ids = excluded.completed_step_ids,
                 failure_reason = excluded.failure_reason,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 status_changed_at = excluded.status_changed_at"#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.workflow_name)
        .bind(instance.status.as_str())
        .bind(to_json(&instance.context)?)
        .bind(to_json(&instance.step_executions)?)
        .bind(to_json(&instance.completed_step_ids)?)
        .bind(&instance.failure_reason)
        .bind(format_datetime(&instance.created_at))
        .bind(instance.started_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.status_changed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(instance.clone())
    }

    async fn find_by_id(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE instance_id = ?"))
            .bind(instance_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_workflow_name(
        &self,
        workflow_name: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE workflow_name = ? {NEWEST_FIRST}"),
            &[workflow_name],
        )
        .await
    }

    async fn find_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE status = ? {NEWEST_FIRST}"),
            &[status.as_str()],
        )
        .await
    }

    async fn find_by_workflow_name_and_status(
        &self,
        workflow_name: &str,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE workflow_name = ? AND status = ? {NEWEST_FIRST}"),
            &[workflow_name, status.as_str()],
        )
        .await
    }

    async fn delete_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists_by_id(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        let count = self
            .count_where(
                "SELECT COUNT(*) FROM workflow_instances WHERE instance_id = ?",
                &[instance_id],
            )
            .await?;
        Ok(count > 0)
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        self.count_where("SELECT COUNT(*) FROM workflow_instances", &[])
            .await
    }

    async fn count_by_status(&self, status: WorkflowStatus) -> Result<u64, RepositoryError> {
        self.count_where(
            "SELECT COUNT(*) FROM workflow_instances WHERE status = ?",
            &[status.as_str()],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::database_url;
    use sagaflow_types::workflow::StepStatus;
    use serde_json::json;

    async fn test_repo() -> (SqliteWorkflowRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        (SqliteWorkflowRepository::new(pool), dir)
    }

    fn instance(name: &str, status: WorkflowStatus) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(name, json!({"user": "ada"}));
        instance.status = status;
        instance
    }

    #[tokio::test]
    async fn save_and_find_round_trips_snapshot() {
        let (repo, _dir) = test_repo().await;
        let mut original = instance("reports", WorkflowStatus::Running);
        original.started_at = Some(Utc::now());
        let mut exec = StepExecution::running("fetch", "Fetch profile");
        exec.status = StepStatus::Completed;
        exec.attempt = 2;
        exec.output = Some(json!({"followers": 42}));
        original.record_completion(exec);

        repo.save(&original).await.unwrap();
        let loaded = repo.find_by_id(&original.instance_id).await.unwrap().unwrap();

        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn save_upserts_existing_row() {
        let (repo, _dir) = test_repo().await;
        let mut inst = instance("reports", WorkflowStatus::Running);
        repo.save(&inst).await.unwrap();

        inst.status = WorkflowStatus::Failed;
        inst.failure_reason = Some("step 'fetch' failed: boom".to_string());
        repo.save(&inst).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        let loaded = repo.find_by_id(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("step 'fetch' failed: boom"));
    }

    #[tokio::test]
    async fn find_missing_returns_none() {
        let (repo, _dir) = test_repo().await;
        assert!(repo.find_by_id("nope").await.unwrap().is_none());
        assert!(!repo.exists_by_id("nope").await.unwrap());
    }

    #[tokio::test]
    async fn queries_filter_and_order_newest_first() {
        let (repo, _dir) = test_repo().await;
        let first = instance("reports", WorkflowStatus::Completed);
        let second = instance("reports", WorkflowStatus::Failed);
        let other = instance("billing", WorkflowStatus::Completed);
        for inst in [&first, &second, &other] {
            repo.save(inst).await.unwrap();
        }

        let reports = repo.find_by_workflow_name("reports").await.unwrap();
        let ids: Vec<&str> = reports.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec![second.instance_id.as_str(), first.instance_id.as_str()]);

        let completed = repo.find_by_status(WorkflowStatus::Completed).await.unwrap();
        assert_eq!(completed.len(), 2);

        let failed_reports = repo
            .find_by_workflow_name_and_status("reports", WorkflowStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed_reports.len(), 1);
        assert_eq!(failed_reports[0].instance_id, second.instance_id);

        assert_eq!(repo.count().await.unwrap(), 3);
        assert_eq!(repo.count_by_status(WorkflowStatus::Completed).await.unwrap(), 2);
        assert_eq!(repo.count_by_status(WorkflowStatus::Paused).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() {
        let (repo, _dir) = test_repo().await;
        let inst = instance("reports", WorkflowStatus::Cancelled);
        repo.save(&inst).await.unwrap();

        assert!(repo.exists_by_id(&inst.instance_id).await.unwrap());
        assert!(repo.delete_by_id(&inst.instance_id).await.unwrap());
        assert!(!repo.delete_by_id(&inst.instance_id).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
