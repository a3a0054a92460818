//! Periodic jobs: expiry-freeze, instance sync, traffic aggregation
//!
//! All three share one lifecycle (initial delay, run-once, tick, dual
//! shutdown, panic-recovering body) and are idempotent per tick.

pub mod error;
pub mod expiry;
pub mod runner;
pub mod sync;
pub mod traffic_job;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use virt_db::DbManager;
use virt_tasks::DriverProvider;

pub use error::{Result, SchedulerError};
pub use expiry::{ExpiryFreezeJob, ExpiryService, REASON_EXPIRED, REASON_NODE_FROZEN};
pub use runner::{Job, Scheduler};
pub use sync::{diff_instances, InstanceSyncJob, StatusChange, SyncReport};
pub use traffic_job::TrafficAggregationJob;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub expiry_check_interval_secs: u64,
    pub instance_sync_interval_mins: u64,
    pub enable_instance_sync: bool,
    pub traffic_aggregation_interval_secs: u64,
    pub daily_traffic_aggregation: bool,
    pub start_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval_secs: 60,
            instance_sync_interval_mins: 30,
            enable_instance_sync: true,
            traffic_aggregation_interval_secs: 3600,
            daily_traffic_aggregation: false,
            start_delay_secs: 10,
        }
    }
}

/// The full scheduler fabric, started together and stopped together.
pub struct SchedulerSet {
    schedulers: Vec<Scheduler>,
}

impl SchedulerSet {
    pub fn start(
        db: Arc<DbManager>,
        drivers: Arc<dyn DriverProvider>,
        config: &SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let delay = Duration::from_secs(config.start_delay_secs);
        let mut schedulers = vec![
            Scheduler::start(
                Arc::new(ExpiryFreezeJob::new(db.clone())),
                delay,
                Duration::from_secs(config.expiry_check_interval_secs),
                shutdown.clone(),
            ),
            Scheduler::start(
                Arc::new(TrafficAggregationJob::new(
                    db.clone(),
                    config.daily_traffic_aggregation,
                )),
                delay,
                Duration::from_secs(config.traffic_aggregation_interval_secs),
                shutdown.clone(),
            ),
        ];
        if config.enable_instance_sync {
            schedulers.push(Scheduler::start(
                Arc::new(InstanceSyncJob::new(db, drivers)),
                delay,
                Duration::from_secs(config.instance_sync_interval_mins * 60),
                shutdown,
            ));
        }
        Self { schedulers }
    }

    pub async fn stop(&self) {
        for scheduler in &self.schedulers {
            scheduler.stop().await;
        }
    }
}
