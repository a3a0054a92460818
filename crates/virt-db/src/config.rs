//! System configuration rows: the database side of the three-way merge

use sqlx::MySqlExecutor;

use crate::error::Result;
use crate::models::ConfigRow;

pub struct ConfigRepo;

impl ConfigRepo {
    pub async fn all(exec: impl MySqlExecutor<'_>) -> Result<Vec<ConfigRow>> {
        Ok(sqlx::query_as::<_, ConfigRow>(
            "SELECT id, category, config_key, config_value, value_type, is_public, updated_at \
             FROM system_config ORDER BY category, config_key",
        )
        .fetch_all(exec)
        .await?)
    }

    pub async fn count(exec: impl MySqlExecutor<'_>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM system_config")
            .fetch_one(exec)
            .await?;
        Ok(count)
    }

    pub async fn upsert(
        exec: impl MySqlExecutor<'_>,
        category: &str,
        key: &str,
        value: &str,
        value_type: &str,
        is_public: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_config (category, config_key, config_value, value_type, is_public) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                config_value = VALUES(config_value), \
                value_type = VALUES(value_type), \
                is_public = VALUES(is_public)",
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(is_public)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn delete(exec: impl MySqlExecutor<'_>, category: &str, key: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM system_config WHERE category = ? AND config_key = ?")
                .bind(category)
                .bind(key)
                .execute(exec)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}
