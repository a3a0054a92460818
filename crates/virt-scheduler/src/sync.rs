//! Instance reconciliation against the backends
//!
//! Each tick discovers every active backend's guests and diffs them against
//! the database, matching by uuid with a name fallback. Backends are swept
//! under a semaphore of two so a slow node cannot hold up the whole pass.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use virt_db::{DbManager, InstanceRepo, InstanceRow};
use virt_tasks::DriverProvider;
use virt_types::DiscoveredInstance;

use crate::error::Result;
use crate::runner::Job;

const SYNC_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub name: String,
    pub recorded: String,
    pub observed: String,
}

/// What a sweep found out of line on one backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub backend_id: i64,
    pub backend_name: String,
    /// Present on the backend, unknown to the database
    pub new: Vec<String>,
    /// Recorded in the database, gone from the backend
    pub missing: Vec<String>,
    pub changed: Vec<StatusChange>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.missing.is_empty() && self.changed.is_empty()
    }
}

/// Remote status words normalised to the database vocabulary
fn normalise_remote_status(status: &str) -> &'static str {
    match status.to_lowercase().as_str() {
        "running" | "up" => "running",
        "stopped" | "exited" | "created" | "dead" | "paused" => "stopped",
        _ => "unknown",
    }
}

/// Pure diff: uuid first, name as fallback.
pub fn diff_instances(recorded: &[InstanceRow], observed: &[DiscoveredInstance]) -> SyncReport {
    let mut report = SyncReport::default();

    let mut matched_observed: HashSet<usize> = HashSet::new();
    for row in recorded {
        let found = observed
            .iter()
            .enumerate()
            .find(|(_, guest)| guest.uuid == row.uuid)
            .or_else(|| {
                observed
                    .iter()
                    .enumerate()
                    .find(|(_, guest)| guest.name == row.name)
            });
        match found {
            Some((index, guest)) => {
                matched_observed.insert(index);
                let observed_status = normalise_remote_status(&guest.status);
                // Only statuses both sides can express are comparable
                if matches!(row.status.as_str(), "running" | "stopped")
                    && observed_status != "unknown"
                    && row.status != observed_status
                {
                    report.changed.push(StatusChange {
                        name: row.name.clone(),
                        recorded: row.status.clone(),
                        observed: observed_status.to_string(),
                    });
                }
            }
            None => report.missing.push(row.name.clone()),
        }
    }

    for (index, guest) in observed.iter().enumerate() {
        if !matched_observed.contains(&index) {
            report.new.push(guest.name.clone());
        }
    }

    report
}

pub struct InstanceSyncJob {
    db: Arc<DbManager>,
    drivers: Arc<dyn DriverProvider>,
}

impl InstanceSyncJob {
    pub fn new(db: Arc<DbManager>, drivers: Arc<dyn DriverProvider>) -> Self {
        Self { db, drivers }
    }

    pub async fn sweep(&self) -> Result<Vec<SyncReport>> {
        let pool = self.db.pool().await;
        let backends = virt_db::BackendRepo::list_active(&pool).await?;
        let semaphore = Arc::new(Semaphore::new(SYNC_CONCURRENCY));

        let mut handles = Vec::with_capacity(backends.len());
        for backend in backends {
            let semaphore = semaphore.clone();
            let drivers = self.drivers.clone();
            let db = self.db.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let pool = db.pool().await;
                let recorded = InstanceRepo::list_by_provider(&pool, backend.id).await.ok()?;
                let driver = drivers.driver(&backend).await.ok()?;
                match driver.discover().await {
                    Ok(observed) => {
                        let mut report = diff_instances(&recorded, &observed);
                        report.backend_id = backend.id;
                        report.backend_name = backend.name.clone();
                        Some(report)
                    }
                    Err(e) => {
                        warn!(backend = %backend.name, error = %e, "discovery failed");
                        None
                    }
                }
            }));
        }

        let mut reports = Vec::new();
        for handle in handles {
            if let Ok(Some(report)) = handle.await {
                if !report.is_clean() {
                    warn!(
                        backend = %report.backend_name,
                        new = report.new.len(),
                        missing = report.missing.len(),
                        changed = report.changed.len(),
                        "instance sync found drift"
                    );
                }
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

#[async_trait]
impl Job for InstanceSyncJob {
    fn name(&self) -> &'static str {
        "instance-sync"
    }

    async fn run(&self) -> Result<()> {
        let reports = self.sweep().await?;
        let drifted = reports.iter().filter(|r| !r.is_clean()).count();
        info!(backends = reports.len(), drifted, "instance sync pass complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use virt_types::InstanceKind;

    fn row(uuid: &str, name: &str, status: &str) -> InstanceRow {
        InstanceRow {
            id: 1,
            uuid: uuid.into(),
            user_id: 7,
            provider_id: 1,
            provider_name: "b1".into(),
            name: name.into(),
            kind: "container".into(),
            cpu_cores: 1,
            memory_mb: 1024,
            disk_mb: 10240,
            bandwidth_mbps: 100,
            image: String::new(),
            image_url: None,
            os: "debian".into(),
            private_ip: None,
            public_ip: None,
            ipv6: None,
            ssh_port: None,
            port_range_start: None,
            port_range_end: None,
            mac: None,
            status: status.into(),
            expires_at: None,
            is_manual_expiry: false,
            is_frozen: false,
            frozen_reason: String::new(),
            max_traffic_mb: 0,
            is_imported: false,
            has_port_conflict: false,
            discovered_data: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn guest(uuid: &str, name: &str, status: &str) -> DiscoveredInstance {
        DiscoveredInstance {
            uuid: uuid.into(),
            name: name.into(),
            status: status.into(),
            kind: InstanceKind::Container,
            cpu_cores: 1,
            memory_mb: 1024,
            disk_mb: 10240,
            private_ip: None,
            public_ip: None,
            ipv6: None,
            ssh_port: None,
            mac: None,
            image: None,
            os: None,
            raw: Value::Null,
        }
    }

    #[test]
    fn clean_when_everything_matches() {
        let report = diff_instances(
            &[row("u1", "demo", "running")],
            &[guest("u1", "demo", "Running")],
        );
        assert!(report.is_clean());
    }

    #[test]
    fn detects_new_missing_and_changed() {
        let recorded = vec![row("u1", "demo", "running"), row("u2", "gone", "running")];
        let observed = vec![
            guest("u1", "demo", "stopped"),
            guest("u3", "stray", "running"),
        ];
        let report = diff_instances(&recorded, &observed);
        assert_eq!(report.new, vec!["stray"]);
        assert_eq!(report.missing, vec!["gone"]);
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].observed, "stopped");
    }

    #[test]
    fn name_fallback_matches_uuidless_guests() {
        let report = diff_instances(
            &[row("u1", "demo", "running")],
            &[guest("105", "demo", "running")],
        );
        assert!(report.is_clean());
    }
}
