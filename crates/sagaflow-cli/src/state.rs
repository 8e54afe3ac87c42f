//! Application state wiring the engine to its infrastructure.
//!
//! The executor is generic over the persistence port; AppState pins it to
//! the SQLite repository and holds the registry of known definitions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sagaflow_core::event::EventBus;
use sagaflow_core::workflow::executor::{DagExecutor, ExecutorConfig};
use sagaflow_core::workflow::registry::WorkflowRegistry;
use sagaflow_infra::sqlite::pool::{DatabasePool, database_url};
use sagaflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use sagaflow_types::config::EngineConfig;

use crate::demo::{self, DemoOptions};

/// Executor pinned to the infra repository.
pub type ConcreteExecutor = DagExecutor<SqliteWorkflowRepository>;

/// Shared application state used by every command handler.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ConcreteExecutor>,
    pub registry: Arc<WorkflowRegistry>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Connect to the database, register definitions and build the executor.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open workflow database")?;
        let repo = SqliteWorkflowRepository::new(db_pool);

        let mut registry = WorkflowRegistry::new();
        registry.register(demo::profile_analysis(&DemoOptions::default())?)?;

        let executor = DagExecutor::new(
            repo,
            EventBus::new(config.events.channel_capacity),
            ExecutorConfig::from(&config.executor),
        );

        tracing::debug!(
            data_dir = %data_dir.display(),
            workflows = ?registry.names(),
            "application state initialised"
        );

        Ok(Self {
            executor: Arc::new(executor),
            registry: Arc::new(registry),
            config,
            data_dir,
        })
    }

    pub fn repo(&self) -> &SqliteWorkflowRepository {
        self.executor.repo()
    }
}
