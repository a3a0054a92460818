//! Raw traffic samples and aggregated history

use chrono::{DateTime, Utc};
use sqlx::MySqlExecutor;

use crate::error::Result;
use crate::models::{TrafficHistoryRow, TrafficSampleRow};

pub struct TrafficRepo;

impl TrafficRepo {
    pub async fn insert_sample(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
        recorded_at: DateTime<Utc>,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO traffic_samples (instance_id, recorded_at, rx_bytes, tx_bytes) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(instance_id)
        .bind(recorded_at)
        .bind(rx_bytes)
        .bind(tx_bytes)
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Samples in the window, ordered by `(recorded_at, id)` so two readings
    /// in the same second keep their insertion order.
    pub async fn samples_in_window(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrafficSampleRow>> {
        Ok(sqlx::query_as::<_, TrafficSampleRow>(
            "SELECT id, instance_id, recorded_at, rx_bytes, tx_bytes FROM traffic_samples \
             WHERE instance_id = ? AND recorded_at >= ? AND recorded_at < ? \
             ORDER BY recorded_at, id",
        )
        .bind(instance_id)
        .bind(from)
        .bind(to)
        .fetch_all(exec)
        .await?)
    }

    pub async fn instances_with_samples(
        exec: impl MySqlExecutor<'_>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT instance_id FROM traffic_samples \
             WHERE recorded_at >= ? AND recorded_at < ?",
        )
        .bind(from)
        .bind(to)
        .fetch_all(exec)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Idempotent history write: re-running aggregation over the same window
    /// overwrites rather than accumulates.
    pub async fn upsert_history(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
        year: i32,
        month: i32,
        day: i32,
        hour: i32,
        traffic_in_mb: u64,
        traffic_out_mb: u64,
        total_used_mb: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO traffic_history \
                (instance_id, year, month, day, hour, traffic_in_mb, traffic_out_mb, total_used_mb) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                traffic_in_mb = VALUES(traffic_in_mb), \
                traffic_out_mb = VALUES(traffic_out_mb), \
                total_used_mb = VALUES(total_used_mb)",
        )
        .bind(instance_id)
        .bind(year)
        .bind(month)
        .bind(day)
        .bind(hour)
        .bind(traffic_in_mb)
        .bind(traffic_out_mb)
        .bind(total_used_mb)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn history_for_instance(
        exec: impl MySqlExecutor<'_>,
        instance_id: i64,
        year: i32,
        month: i32,
    ) -> Result<Vec<TrafficHistoryRow>> {
        Ok(sqlx::query_as::<_, TrafficHistoryRow>(
            "SELECT id, instance_id, year, month, day, hour, traffic_in_mb, traffic_out_mb, \
                total_used_mb, updated_at \
             FROM traffic_history WHERE instance_id = ? AND year = ? AND month = ? \
             ORDER BY day, hour",
        )
        .bind(instance_id)
        .bind(year)
        .bind(month)
        .fetch_all(exec)
        .await?)
    }

    /// Per-instance raw data cleanup, used when an instance is deleted
    pub async fn purge_samples(exec: impl MySqlExecutor<'_>, instance_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_samples WHERE instance_id = ?")
            .bind(instance_id)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }
}
