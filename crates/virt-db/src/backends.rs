//! Backend (provider) repository

use chrono::{DateTime, Utc};
use sqlx::MySqlExecutor;
use virt_types::ResourceVector;

use crate::error::{DbError, Result};
use crate::models::BackendRow;

const COLUMNS: &str = "id, name, kind, region, architecture, host, ssh_port, ssh_username, \
     ssh_password, ssh_private_key, api_cert, api_cert_key, api_token, execution_rule, \
     allow_concurrent_tasks, max_concurrent_tasks, ipv4_mapping_method, ipv6_mapping_method, \
     network_type, traffic_count_mode, traffic_multiplier, enable_traffic_control, \
     port_range_start, port_range_end, total_cpu_cores, total_memory_mb, total_disk_mb, \
     used_cpu_cores, used_memory_mb, used_disk_mb, status, is_frozen, frozen_at, frozen_reason, \
     expires_at, is_manual_expiry, public_ip, port_ip, created_at, updated_at, deleted_at";

pub struct BackendRepo;

impl BackendRepo {
    pub async fn get(exec: impl MySqlExecutor<'_>, id: i64) -> Result<BackendRow> {
        let sql = format!(
            "SELECT {} FROM backends WHERE id = ? AND deleted_at IS NULL",
            COLUMNS
        );
        sqlx::query_as::<_, BackendRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("backend", id))
    }

    pub async fn list_active(exec: impl MySqlExecutor<'_>) -> Result<Vec<BackendRow>> {
        let sql = format!(
            "SELECT {} FROM backends WHERE deleted_at IS NULL AND status = 'active' AND is_frozen = FALSE",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, BackendRow>(&sql).fetch_all(exec).await?)
    }

    pub async fn list_all(exec: impl MySqlExecutor<'_>) -> Result<Vec<BackendRow>> {
        let sql = format!("SELECT {} FROM backends WHERE deleted_at IS NULL", COLUMNS);
        Ok(sqlx::query_as::<_, BackendRow>(&sql).fetch_all(exec).await?)
    }

    /// Backends whose expiry has passed and that are not frozen yet
    pub async fn list_expired(
        exec: impl MySqlExecutor<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BackendRow>> {
        let sql = format!(
            "SELECT {} FROM backends WHERE deleted_at IS NULL AND is_frozen = FALSE \
             AND expires_at IS NOT NULL AND expires_at <= ?",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, BackendRow>(&sql)
            .bind(now)
            .fetch_all(exec)
            .await?)
    }

    pub async fn freeze(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backends SET is_frozen = TRUE, frozen_at = ?, frozen_reason = ? \
             WHERE id = ? AND deleted_at IS NULL AND is_frozen = FALSE",
        )
        .bind(now)
        .bind(reason)
        .bind(id)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("backend freeze"));
        }
        Ok(())
    }

    /// Thaw only applies when the freeze reason matches; a manual freeze for
    /// another reason stays in place.
    pub async fn thaw_if_reason(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backends SET is_frozen = FALSE, frozen_at = NULL, frozen_reason = '' \
             WHERE id = ? AND is_frozen = TRUE AND frozen_reason = ?",
        )
        .bind(id)
        .bind(reason)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_expiry(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
        is_manual: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backends SET expires_at = ?, is_manual_expiry = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(expires_at)
        .bind(is_manual)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Reserve physical capacity. The guard keeps `used ≤ total` in every
    /// dimension; zero rows affected means the backend is out of capacity.
    pub async fn take_capacity(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        spec: &ResourceVector,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backends SET \
                used_cpu_cores = used_cpu_cores + ?, \
                used_memory_mb = used_memory_mb + ?, \
                used_disk_mb = used_disk_mb + ? \
             WHERE id = ? AND deleted_at IS NULL \
               AND used_cpu_cores + ? <= total_cpu_cores \
               AND used_memory_mb + ? <= total_memory_mb \
               AND used_disk_mb + ? <= total_disk_mb",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(id)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release physical capacity. The guard keeps counters non-negative;
    /// zero rows affected indicates an accounting fault and aborts the caller.
    pub async fn release_capacity(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backends SET \
                used_cpu_cores = used_cpu_cores - ?, \
                used_memory_mb = used_memory_mb - ?, \
                used_disk_mb = used_disk_mb - ? \
             WHERE id = ? \
               AND used_cpu_cores >= ? \
               AND used_memory_mb >= ? \
               AND used_disk_mb >= ?",
        )
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .bind(id)
        .bind(spec.cpu_cores)
        .bind(spec.memory_mb)
        .bind(spec.disk_mb)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation("backend capacity release"));
        }
        Ok(())
    }

    /// Retiring a backend requires its instances to be removed first.
    pub async fn soft_delete(exec: impl MySqlExecutor<'_>, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backends SET deleted_at = NOW() WHERE id = ? AND deleted_at IS NULL \
             AND NOT EXISTS (SELECT 1 FROM instances WHERE provider_id = ? AND deleted_at IS NULL)",
        )
        .bind(id)
        .bind(id)
        .execute(exec)
        .await?;
        if result.rows_affected() != 1 {
            return Err(DbError::GuardViolation(
                "backend soft delete (instances must be removed or reassigned first)",
            ));
        }
        Ok(())
    }
}
