//! Per-task execution context handed to handlers

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::mysql::MySqlPool;
use tracing::warn;

use virt_backends::BackendDriver;
use virt_db::{BackendRepo, BackendRow, DbManager, TaskRepo, TaskRow};
use virt_ssh::SshClient;

use crate::error::{Result, TaskError};

/// Supplies a live driver and SSH channel for a backend. Implemented by the
/// orchestrator's connection manager; mocked in engine tests.
#[async_trait]
pub trait DriverProvider: Send + Sync {
    async fn driver(&self, backend: &BackendRow) -> Result<Arc<dyn BackendDriver>>;

    async fn ssh(&self, backend: &BackendRow) -> Result<Arc<SshClient>>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub delete_retry_count: u32,
    pub delete_retry_delay_secs: u64,
    pub password_retry_count: u32,
    pub default_timeout_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delete_retry_count: 3,
            delete_retry_delay_secs: 2,
            password_retry_count: 3,
            default_timeout_secs: 1800,
        }
    }
}

/// What a handler reports back on success
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl HandlerOutcome {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

pub struct TaskContext {
    pub db: Arc<DbManager>,
    pub drivers: Arc<dyn DriverProvider>,
    pub config: EngineConfig,
    pub task: TaskRow,
}

impl TaskContext {
    pub async fn pool(&self) -> MySqlPool {
        self.db.pool().await
    }

    /// Progress writes never fail the task; a lost update is only cosmetic.
    pub async fn progress(&self, percent: u8, message: &str) {
        let pool = self.pool().await;
        if let Err(e) = TaskRepo::update_progress(&pool, &self.task.uuid, percent, message).await {
            warn!(task = %self.task.uuid, percent, error = %e, "progress update failed");
        }
    }

    pub async fn backend(&self, provider_id: i64) -> Result<BackendRow> {
        let pool = self.pool().await;
        Ok(BackendRepo::get(&pool, provider_id).await?)
    }

    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.task.payload.clone())
            .map_err(|e| TaskError::Payload(e.to_string()))
    }
}
