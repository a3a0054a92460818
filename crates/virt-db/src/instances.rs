//! Instance repository

use chrono::{DateTime, Utc};
use sqlx::MySqlExecutor;
use virt_types::InstanceStatus;

use crate::error::{DbError, Result};
use crate::models::{InstanceRow, NewInstance};

const COLUMNS: &str = "id, uuid, user_id, provider_id, provider_name, name, kind, cpu_cores, \
     memory_mb, disk_mb, bandwidth_mbps, image, image_url, os, private_ip, public_ip, ipv6, \
     ssh_port, port_range_start, port_range_end, mac, status, expires_at, is_manual_expiry, \
     is_frozen, frozen_reason, max_traffic_mb, is_imported, has_port_conflict, discovered_data, \
     created_at, updated_at, deleted_at";

pub struct InstanceRepo;

impl InstanceRepo {
    pub async fn get(exec: impl MySqlExecutor<'_>, id: i64) -> Result<InstanceRow> {
        let sql = format!(
            "SELECT {} FROM instances WHERE id = ? AND deleted_at IS NULL",
            COLUMNS
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("instance", id))
    }

    /// Row-locked load used inside mutating transactions
    pub async fn get_for_update(exec: impl MySqlExecutor<'_>, id: i64) -> Result<InstanceRow> {
        let sql = format!(
            "SELECT {} FROM instances WHERE id = ? AND deleted_at IS NULL FOR UPDATE",
            COLUMNS
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("instance", id))
    }

    pub async fn find_by_name(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
        name: &str,
    ) -> Result<Option<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM instances WHERE provider_id = ? AND name = ? AND deleted_at IS NULL",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(provider_id)
            .bind(name)
            .fetch_optional(exec)
            .await?)
    }

    pub async fn list_by_provider(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
    ) -> Result<Vec<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM instances WHERE provider_id = ? AND deleted_at IS NULL",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(provider_id)
            .fetch_all(exec)
            .await?)
    }

    pub async fn count_active_for_user(exec: impl MySqlExecutor<'_>, user_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE user_id = ? AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(exec)
        .await?;
        Ok(count)
    }

    pub async fn insert(exec: impl MySqlExecutor<'_>, new: &NewInstance) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO instances (uuid, user_id, provider_id, provider_name, name, kind, \
                cpu_cores, memory_mb, disk_mb, bandwidth_mbps, image, image_url, os, status, \
                expires_at, is_manual_expiry, max_traffic_mb) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.uuid)
        .bind(new.user_id)
        .bind(new.provider_id)
        .bind(&new.provider_name)
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(new.resources.cpu_cores)
        .bind(new.resources.memory_mb)
        .bind(new.resources.disk_mb)
        .bind(new.resources.bandwidth_mbps)
        .bind(&new.image)
        .bind(&new.image_url)
        .bind(&new.os)
        .bind(new.status.as_str())
        .bind(new.expires_at)
        .bind(new.is_manual_expiry)
        .bind(new.max_traffic_mb)
        .execute(exec)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    pub async fn update_status(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        status: InstanceStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE instances SET status = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(status.as_str())
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn set_running(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        private_ip: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET status = 'running', private_ip = COALESCE(?, private_ip) \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(private_ip)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn update_network(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        private_ip: Option<&str>,
        ipv6: Option<&str>,
        mac: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET private_ip = COALESCE(?, private_ip), \
                ipv6 = COALESCE(?, ipv6), mac = COALESCE(?, mac) \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(private_ip)
        .bind(ipv6)
        .bind(mac)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn update_ssh_port(exec: impl MySqlExecutor<'_>, id: i64, port: u16) -> Result<()> {
        sqlx::query("UPDATE instances SET ssh_port = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(port as i32)
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn update_port_range(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        start: u16,
        end: u16,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET port_range_start = ?, port_range_end = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(start as i32)
        .bind(end as i32)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Rename to `<name>_deleted_<unix>` then soft-delete, freeing the
    /// (provider_id, name) pair while traffic history keyed by id stays valid.
    pub async fn rename_and_soft_delete(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let renamed = sqlx::query(
            "UPDATE instances \
             SET name = CONCAT(name, '_deleted_', ?), deleted_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now.timestamp())
        .bind(now)
        .bind(id)
        .execute(exec)
        .await?;
        if renamed.rows_affected() != 1 {
            return Err(DbError::GuardViolation("instance rename-and-soft-delete"));
        }
        Ok(format!("_deleted_{}", now.timestamp()))
    }

    pub async fn freeze(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE instances SET is_frozen = TRUE, frozen_reason = ?, status = 'frozen' \
             WHERE id = ? AND deleted_at IS NULL AND is_frozen = FALSE",
        )
        .bind(reason)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn thaw_if_reason(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE instances SET is_frozen = FALSE, frozen_reason = '', status = 'running' \
             WHERE id = ? AND deleted_at IS NULL AND is_frozen = TRUE AND frozen_reason = ?",
        )
        .bind(id)
        .bind(reason)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Expired, unfrozen instances due for the freeze pass
    pub async fn list_expired(
        exec: impl MySqlExecutor<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM instances WHERE deleted_at IS NULL AND is_frozen = FALSE \
             AND expires_at IS NOT NULL AND expires_at <= ?",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(now)
            .fetch_all(exec)
            .await?)
    }

    /// Traffic history stays keyed by id after soft deletion; aggregation
    /// still needs the row.
    pub async fn get_including_deleted(
        exec: impl MySqlExecutor<'_>,
        id: i64,
    ) -> Result<InstanceRow> {
        let sql = format!("SELECT {} FROM instances WHERE id = ?", COLUMNS);
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("instance", id))
    }

    /// Undo a freeze cascade when its backend thaws
    pub async fn thaw_cascade(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE instances SET is_frozen = FALSE, frozen_reason = '', status = 'running' \
             WHERE provider_id = ? AND deleted_at IS NULL AND is_frozen = TRUE AND frozen_reason = ?",
        )
        .bind(provider_id)
        .bind(reason)
        .execute(exec)
        .await?;
        Ok(result.rows_affected())
    }

    /// Automatic-expiry instances on a backend, for the freeze cascade
    pub async fn freeze_cascade(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE instances SET is_frozen = TRUE, frozen_reason = ?, status = 'frozen' \
             WHERE provider_id = ? AND deleted_at IS NULL AND is_frozen = FALSE \
               AND is_manual_expiry = FALSE",
        )
        .bind(reason)
        .bind(provider_id)
        .execute(exec)
        .await?;
        Ok(result.rows_affected())
    }

    /// Ports recorded directly on instance rows (ssh_port and port ranges),
    /// which the allocator must avoid alongside the mapping table.
    pub async fn reserved_ports(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
    ) -> Result<Vec<(Option<i32>, Option<i32>, Option<i32>)>> {
        let rows: Vec<(Option<i32>, Option<i32>, Option<i32>)> = sqlx::query_as(
            "SELECT ssh_port, port_range_start, port_range_end FROM instances \
             WHERE provider_id = ? AND deleted_at IS NULL",
        )
        .bind(provider_id)
        .fetch_all(exec)
        .await?;
        Ok(rows)
    }

    pub async fn set_expiry(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
        is_manual: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET expires_at = ?, is_manual_expiry = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(expires_at)
        .bind(is_manual)
        .bind(id)
        .execute(exec)
        .await?;
        Ok(())
    }
}
