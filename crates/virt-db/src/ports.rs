//! Port mapping repository

use sqlx::MySqlExecutor;
use virt_types::{MappingStatus, Protocol};

use crate::error::{DbError, Result};
use crate::models::{NewPortMapping, PortMappingRow};

const COLUMNS: &str = "id, instance_id, provider_id, host_port, guest_port, protocol, \
     mapping_method, status, is_ssh, is_automatic, port_type, ipv6_enabled, created_at, updated_at";

pub struct PortMappingRepo;

impl PortMappingRepo {
    pub async fn get(exec: impl MySqlExecutor<'_>, id: i64) -> Result<PortMappingRow> {
        let sql = format!("SELECT {} FROM port_mappings WHERE id = ?", COLUMNS);
        sqlx::query_as::<_, PortMappingRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("port mapping", id))
    }

    /// Host ports already spoken for on a backend. `pending` rows count:
    /// they are reserved while their remote apply is in flight.
    pub async fn reserved_host_ports(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
    ) -> Result<Vec<PortMappingRow>> {
        let sql = format!(
            "SELECT {} FROM port_mappings WHERE provider_id = ? AND status IN ('active', 'pending')",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, PortMappingRow>(&sql)
            .bind(provider_id)
            .fetch_all(exec)
            .await?)
    }

    pub async fn list_for_instance(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
    ) -> Result<Vec<PortMappingRow>> {
        let sql = format!(
            "SELECT {} FROM port_mappings WHERE instance_id = ? AND status IN ('active', 'pending') \
             ORDER BY host_port",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, PortMappingRow>(&sql)
            .bind(instance_id)
            .fetch_all(exec)
            .await?)
    }

    /// (provider, host_port, protocol) must be unique among live rows;
    /// `both` collides with either concrete protocol.
    pub async fn find_conflict(
        exec: impl MySqlExecutor<'_>,
        provider_id: i64,
        host_port: u16,
        protocol: Protocol,
    ) -> Result<Option<PortMappingRow>> {
        let sql = format!(
            "SELECT {} FROM port_mappings WHERE provider_id = ? AND host_port = ? \
             AND status IN ('active', 'pending') AND (protocol = ? OR protocol = 'both' OR ? = 'both') \
             LIMIT 1",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, PortMappingRow>(&sql)
            .bind(provider_id)
            .bind(host_port as i32)
            .bind(protocol.as_str())
            .bind(protocol.as_str())
            .fetch_optional(exec)
            .await?)
    }

    pub async fn insert(exec: impl MySqlExecutor<'_>, new: &NewPortMapping) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO port_mappings (instance_id, provider_id, host_port, guest_port, \
                protocol, mapping_method, status, is_ssh, is_automatic, port_type, ipv6_enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.instance_id)
        .bind(new.provider_id)
        .bind(new.host_port as i32)
        .bind(new.guest_port as i32)
        .bind(new.protocol.as_str())
        .bind(new.mapping_method.as_str())
        .bind(new.status.as_str())
        .bind(new.is_ssh)
        .bind(new.is_automatic)
        .bind(new.port_type.as_str())
        .bind(new.ipv6_enabled)
        .execute(exec)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    pub async fn set_status(
        exec: impl MySqlExecutor<'_>,
        id: i64,
        status: MappingStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE port_mappings SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn delete(exec: impl MySqlExecutor<'_>, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM port_mappings WHERE id = ?")
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn delete_for_instance(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM port_mappings WHERE instance_id = ?")
            .bind(instance_id)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }
}
