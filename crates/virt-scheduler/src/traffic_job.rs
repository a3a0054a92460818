//! Periodic traffic aggregation
//!
//! Runs the monthly window for every instance with raw samples in it, plus
//! the daily window when enabled. The aggregation itself (segmentation,
//! count-mode fold, upsert) is idempotent, so overlapping runs converge on
//! identical history rows.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use virt_db::{BackendRepo, DbManager, InstanceRepo, TrafficRepo};
use virt_resources::{TrafficAggregator, Window};
use virt_types::TrafficCountMode;

use crate::error::Result;
use crate::runner::Job;

pub struct TrafficAggregationJob {
    db: Arc<DbManager>,
    pub daily_enabled: bool,
}

impl TrafficAggregationJob {
    pub fn new(db: Arc<DbManager>, daily_enabled: bool) -> Self {
        Self { db, daily_enabled }
    }

    async fn aggregate_window(&self, window: &Window) -> Result<usize> {
        let pool = self.db.pool().await;
        let instance_ids =
            TrafficRepo::instances_with_samples(&pool, window.from, window.to).await?;
        let mut aggregated = 0;

        for instance_id in instance_ids {
            // Soft-deleted instances still aggregate: history stays keyed by id
            let instance = match InstanceRepo::get_including_deleted(&pool, instance_id).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(instance_id, error = %e, "skipping orphaned traffic samples");
                    continue;
                }
            };
            let (mode, multiplier) = match BackendRepo::get(&pool, instance.provider_id).await {
                Ok(backend) => (
                    backend
                        .traffic_count_mode()
                        .unwrap_or(TrafficCountMode::Both),
                    backend.traffic_multiplier,
                ),
                // The backend may be retired; bill conservatively
                Err(_) => (TrafficCountMode::Both, 1.0),
            };
            if let Err(e) =
                TrafficAggregator::aggregate_instance(&pool, instance_id, window, mode, multiplier)
                    .await
            {
                warn!(instance_id, error = %e, "traffic aggregation failed");
                continue;
            }
            aggregated += 1;
        }
        Ok(aggregated)
    }
}

#[async_trait]
impl Job for TrafficAggregationJob {
    fn name(&self) -> &'static str {
        "traffic-aggregation"
    }

    async fn run(&self) -> Result<()> {
        let now = Utc::now();
        let monthly = self.aggregate_window(&Window::month_of(now)).await?;
        let daily = if self.daily_enabled {
            self.aggregate_window(&Window::day_of(now)).await?
        } else {
            0
        };
        info!(monthly, daily, "traffic aggregation pass complete");
        Ok(())
    }
}
