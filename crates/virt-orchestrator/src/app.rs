//! Application context: explicit wiring, no globals
//!
//! Construction order follows the dependency spine: database → configuration
//! → connections → driver factory → task engine (with boot recovery) →
//! schedulers. Shutdown walks the same spine in reverse.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use virt_config::{ConfigManager, ConfigPaths};
use virt_db::{with_read_retry, BackendRepo, BackendRow, DbConfig, DbManager, TaskRepo, TaskRow};
use virt_health::{HealthChecker, HealthResult};
use virt_scheduler::{SchedulerConfig, SchedulerSet};
use virt_tasks::{DriverProvider, EngineConfig, TaskEngine};

use crate::connections::{target_from_row, ConnectionManager};
use crate::factory::DriverFactory;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DbConfig,
    pub config_paths: ConfigPaths,
    pub engine: EngineConfig,
    pub schedulers: SchedulerConfig,
    pub cdn_endpoints: Vec<String>,
}

pub struct AppContext {
    pub db: Arc<DbManager>,
    pub config: Arc<ConfigManager>,
    pub connections: Arc<ConnectionManager>,
    pub drivers: Arc<dyn DriverProvider>,
    pub engine: TaskEngine,
    schedulers: SchedulerSet,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    pub async fn start(config: AppConfig) -> anyhow::Result<Self> {
        let db = DbManager::connect(config.database).await?;
        db.migrate().await?;

        let config_manager = ConfigManager::load(db.clone(), config.config_paths).await?;

        let connections = Arc::new(ConnectionManager::new());
        let drivers: Arc<dyn DriverProvider> = Arc::new(DriverFactory::new(
            connections.clone(),
            config.cdn_endpoints.clone(),
        ));

        let engine = TaskEngine::new(db.clone(), drivers.clone(), config.engine.clone());
        let (reaped, resumed) = engine.recover().await?;
        info!(reaped, resumed, "task engine recovered");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let schedulers =
            SchedulerSet::start(db.clone(), drivers.clone(), &config.schedulers, shutdown_rx);

        info!("orchestrator started");
        Ok(Self {
            db,
            config: config_manager,
            connections,
            drivers,
            engine,
            schedulers,
            shutdown: shutdown_tx,
        })
    }

    /// Graceful shutdown: stop schedulers, drain worker pools (in-flight
    /// contexts run out within their own timeouts), close SSH, shut the
    /// database manager down last.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.schedulers.stop().await;
        self.engine.shutdown().await;
        self.connections.close_all().await;
        self.db.shutdown().await;
        info!("orchestrator shut down");
    }

    /// Task-status query surface for the external HTTP layer
    pub async fn task_status(&self, uuid: &str) -> anyhow::Result<TaskRow> {
        let pool = self.db.pool().await;
        Ok(with_read_retry(|| TaskRepo::get(&pool, uuid)).await?)
    }

    pub async fn list_backends(&self) -> anyhow::Result<Vec<BackendRow>> {
        let pool = self.db.pool().await;
        Ok(with_read_retry(|| BackendRepo::list_all(&pool)).await?)
    }

    /// Health checker for a backend. `borrow_ssh` reuses the orchestrator's
    /// client (the checker then never dials and never closes it); otherwise
    /// the checker owns a target of its own and redials per check.
    pub async fn health_check(
        &self,
        backend: &BackendRow,
        borrow_ssh: bool,
    ) -> anyhow::Result<HealthResult> {
        let kind = backend.kind()?;
        let api_url = match kind {
            virt_types::BackendKind::Proxmox => {
                format!("https://{}:8006/api2/json/version", backend.host)
            }
            virt_types::BackendKind::Lxd | virt_types::BackendKind::Incus => {
                format!("https://{}:8443/1.0", backend.host)
            }
            virt_types::BackendKind::Docker => format!("http://{}:2375/_ping", backend.host),
        };

        let checker = if borrow_ssh {
            let ssh = self.connections.client_for(backend).await?;
            HealthChecker::new(kind).with_borrowed_ssh(ssh)
        } else {
            HealthChecker::new(kind).with_owned_ssh(target_from_row(backend))
        }
        .with_api(api_url, true);

        let result = checker.check().await;
        checker.close().await;
        Ok(result)
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}
