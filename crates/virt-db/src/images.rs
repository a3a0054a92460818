//! System image catalog

use sqlx::MySqlExecutor;
use virt_types::{BackendKind, InstanceKind};

use crate::error::{DbError, Result};
use crate::models::SystemImageRow;

const COLUMNS: &str =
    "id, backend_kind, instance_kind, os, architecture, name, url, status, created_at";

pub struct SystemImageRepo;

impl SystemImageRepo {
    pub async fn get(exec: impl MySqlExecutor<'_>, id: i64) -> Result<SystemImageRow> {
        let sql = format!("SELECT {} FROM system_images WHERE id = ?", COLUMNS);
        sqlx::query_as::<_, SystemImageRow>(&sql)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| DbError::not_found("system image", id))
    }

    /// Catalog lookup for a create: the active image matching the backend
    /// type, instance type, OS and architecture.
    pub async fn find(
        exec: impl MySqlExecutor<'_>,
        backend_kind: BackendKind,
        instance_kind: InstanceKind,
        os: &str,
        architecture: &str,
    ) -> Result<Option<SystemImageRow>> {
        let sql = format!(
            "SELECT {} FROM system_images \
             WHERE backend_kind = ? AND instance_kind = ? AND os = ? AND architecture = ? \
               AND status = 'active' \
             ORDER BY id DESC LIMIT 1",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, SystemImageRow>(&sql)
            .bind(backend_kind.as_str())
            .bind(instance_kind.as_str())
            .bind(os)
            .bind(architecture)
            .fetch_optional(exec)
            .await?)
    }

    pub async fn list_active(exec: impl MySqlExecutor<'_>) -> Result<Vec<SystemImageRow>> {
        let sql = format!(
            "SELECT {} FROM system_images WHERE status = 'active'",
            COLUMNS
        );
        Ok(sqlx::query_as::<_, SystemImageRow>(&sql)
            .fetch_all(exec)
            .await?)
    }
}
