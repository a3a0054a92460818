//! User quota repository: the `used` / `pending` accounting plane

use chrono::{DateTime, Utc};
use sqlx::MySqlExecutor;
use virt_types::ResourceVector;

use crate::error::{DbError, Result};
use crate::models::{LevelLimits, UserQuotaRow};

const USER_COLUMNS: &str = "id, level, status, expires_at, used_cpu_cores, used_memory_mb, \
     used_disk_mb, used_bandwidth_mbps, pending_cpu_cores, pending_memory_mb, pending_disk_mb, \
     pending_bandwidth_mbps";

pub struct QuotaRepo;

impl QuotaRepo {
    pub async fn get_user(exec: impl MySqlExecutor<'_>, user_id: i64) -> Result<UserQuotaRow> {
        let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
        sqlx::query_as::<_, UserQuotaRow>(&sql)
            .bind(user_id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("user", user_id))
    }

    pub async fn level_limits(exec: impl MySqlExecutor<'_>, level: i32) -> Result<LevelLimits> {
        sqlx::query_as::<_, LevelLimits>(
            "SELECT level, max_instances, max_cpu_cores, max_memory_mb, max_disk_mb, \
                max_bandwidth_mbps, max_traffic_mb, expiry_days \
             FROM level_limits WHERE level = ?",
        )
        .bind(level)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| DbError::not_found("level limits", level))
    }

    /// Reserve quota for an in-flight create. The guard enforces
    /// `used + pending + spec ≤ max` per dimension against the user's level
    /// limits; zero rows affected means the quota is exhausted.
    pub async fn reserve_pending(
        exec: impl MySqlExecutor<'_>,
        user_id: i64,
        spec: &ResourceVector,
        limits: &LevelLimits,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET \
                pending_cpu_cores = pending_cpu_cores + ?, \
                pending_memory_mb = pending_memory_mb + ?, \
                pending_disk_mb = pending_disk_mb + ?, \
                pending_bandwidth_mbps = pending_bandwidth_mbps + ? \
             WHERE id = ? \
               AND used_cpu_cores + pending_cpu_cores + ? <= ? \
               AND used_memory_mb + pending_memory_mb + ? <= ? \
               AND used_disk_mb + pending_disk_mb + ? <= ? \
               AND used_bandwidth_mbps + pending_bandwidth_mbps + ? <= ?",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(user_id)
        .bind(spec.cpu_cores)
        .bind(limits.max_cpu_cores)
        .bind(spec.memory_mb)
        .bind(limits.max_memory_mb)
        .bind(spec.disk_mb)
        .bind(limits.max_disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(limits.max_bandwidth_mbps)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Successful create: pending becomes used.
    pub async fn confirm_pending(
        exec: impl MySqlExecutor<'_>,
        user_id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET \
                pending_cpu_cores = pending_cpu_cores - ?, \
                pending_memory_mb = pending_memory_mb - ?, \
                pending_disk_mb = pending_disk_mb - ?, \
                pending_bandwidth_mbps = pending_bandwidth_mbps - ?, \
                used_cpu_cores = used_cpu_cores + ?, \
                used_memory_mb = used_memory_mb + ?, \
                used_disk_mb = used_disk_mb + ?, \
                used_bandwidth_mbps = used_bandwidth_mbps + ? \
             WHERE id = ? \
               AND pending_cpu_cores >= ? \
               AND pending_memory_mb >= ? \
               AND pending_disk_mb >= ? \
               AND pending_bandwidth_mbps >= ?",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(user_id)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("quota confirm pending"));
        }
        Ok(())
    }

    /// Failed or abandoned create: the reservation is returned.
    pub async fn release_pending(
        exec: impl MySqlExecutor<'_>,
        user_id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET \
                pending_cpu_cores = pending_cpu_cores - ?, \
                pending_memory_mb = pending_memory_mb - ?, \
                pending_disk_mb = pending_disk_mb - ?, \
                pending_bandwidth_mbps = pending_bandwidth_mbps - ? \
             WHERE id = ? \
               AND pending_cpu_cores >= ? \
               AND pending_memory_mb >= ? \
               AND pending_disk_mb >= ? \
               AND pending_bandwidth_mbps >= ?",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(user_id)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("quota release pending"));
        }
        Ok(())
    }

    /// Deleting a confirmed instance returns its used quota.
    pub async fn release_used(
        exec: impl MySqlExecutor<'_>,
        user_id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET \
                used_cpu_cores = used_cpu_cores - ?, \
                used_memory_mb = used_memory_mb - ?, \
                used_disk_mb = used_disk_mb - ?, \
                used_bandwidth_mbps = used_bandwidth_mbps - ? \
             WHERE id = ? \
               AND used_cpu_cores >= ? \
               AND used_memory_mb >= ? \
               AND used_disk_mb >= ? \
               AND used_bandwidth_mbps >= ?",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .bind(user_id)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(spec.bandwidth_mbps)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("quota release used"));
        }
        Ok(())
    }

    /// Users past their expiry and still active, for the freeze pass
    pub async fn list_expired_users(
        exec: impl MySqlExecutor<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserQuotaRow>> {
        let sql = format!(
            "SELECT {} FROM users WHERE status = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, UserQuotaRow>(&sql)
            .bind(now)
            .fetch_all(exec)
            .await?)
    }

    pub async fn freeze_user(exec: impl MySqlExecutor<'_>, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET status = 0 WHERE id = ? AND status = 1")
            .bind(user_id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn thaw_user(exec: impl MySqlExecutor<'_>, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET status = 1 WHERE id = ? AND status = 0")
            .bind(user_id)
            .execute(exec)
            .await?;
        Ok(())
    }
}
