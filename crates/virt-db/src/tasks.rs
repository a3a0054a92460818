//! Task repository, including the worker claim protocol

use chrono::{DateTime, Utc};
use sqlx::mysql::MySql;
use sqlx::{MySqlExecutor, Transaction};
use virt_types::TaskStatus;

use crate::error::{DbError, Result};
use crate::models::{NewTask, TaskRow};

const COLUMNS: &str = "id, uuid, user_id, provider_id, instance_id, task_type, payload, status, \
     progress, progress_message, timeout_seconds, is_force_stoppable, started_at, completed_at, \
     error_message, result_data, created_at, updated_at";

pub struct TaskRepo;

impl TaskRepo {
    pub async fn insert(exec: impl MySqlExecutor<'_>, new: &NewTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (uuid, user_id, provider_id, instance_id, task_type, payload, \
                timeout_seconds, is_force_stoppable) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.uuid)
        .bind(new.user_id)
        .bind(new.provider_id)
        .bind(new.instance_id)
        .bind(new.task_type.as_str())
        .bind(&new.payload)
        .bind(new.timeout_seconds)
        .bind(new.is_force_stoppable)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn get(exec: impl MySqlExecutor<'_>, uuid: &str) -> Result<TaskRow> {
        let sql = format!("SELECT {} FROM tasks WHERE uuid = ?", COLUMNS);
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(uuid)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("task", uuid))
    }

    /// Claim a pending task for execution.
    ///
    /// The row is locked, checked, and flipped `pending → running` under a
    /// `WHERE status = 'pending'` guard; two workers racing on one task
    /// produce exactly one winner. Returns `None` when another worker (or a
    /// cancel) got there first.
    pub async fn claim(
        tx: &mut Transaction<'static, MySql>,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRow>> {
        let sql = format!("SELECT {} FROM tasks WHERE uuid = ? FOR UPDATE", COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(uuid)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| DbError::not_found("task", uuid))?;

        if row.status()? != TaskStatus::Pending {
            return Ok(None);
        }

        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ? \
             WHERE uuid = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(uuid)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("task claim"));
        }
        Ok(Some(row))
    }

    /// Progress is monotone per task; stale writers lose.
    pub async fn update_progress(
        exec: impl MySqlExecutor<'_>,
        uuid: &str,
        percent: u8,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET progress = ?, progress_message = ? \
             WHERE uuid = ? AND status = 'running' AND progress <= ?",
        )
        .bind(percent.min(100) as i32)
        .bind(message)
        .bind(uuid)
        .bind(percent.min(100) as i32)
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Terminal transition; refuses to regress an already-terminal row.
    pub async fn finish(
        exec: impl MySqlExecutor<'_>,
        uuid: &str,
        status: TaskStatus,
        error_message: Option<&str>,
        result_data: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = ?, error_message = ?, result_data = ? \
             WHERE uuid = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(error_message)
        .bind(result_data)
        .bind(uuid)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("task finish"));
        }
        Ok(())
    }

    /// External cancellation; only non-terminal rows move.
    pub async fn cancel(
        exec: impl MySqlExecutor<'_>,
        uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', completed_at = ? \
             WHERE uuid = ? AND status IN ('pending', 'running') AND is_force_stoppable = TRUE",
        )
        .bind(now)
        .bind(uuid)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Tasks left `running` by a dead process are reaped at boot.
    pub async fn reap_running(exec: impl MySqlExecutor<'_>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', completed_at = ?, \
                error_message = 'process restarted while task was running' \
             WHERE status = 'running'",
        )
        .bind(now)
        .execute(exec)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_pending(exec: impl MySqlExecutor<'_>) -> Result<Vec<TaskRow>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'pending' ORDER BY id",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, TaskRow>(&sql).fetch_all(exec).await?)
    }
}
