//! Owner of the primary database handle
//!
//! The pool lives behind a writer lock so a reconnect can swap it without
//! disturbing components that cloned it for an in-flight query.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::Transaction;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DbError, Result};

const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_FAILURE_THRESHOLD: u32 = 3;
const USAGE_WARN_PERCENT: f64 = 80.0;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub heartbeat_interval_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 32,
            heartbeat_interval_secs: 30,
        }
    }
}

pub struct DbManager {
    config: DbConfig,
    pool: RwLock<MySqlPool>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl DbManager {
    pub async fn connect(config: DbConfig) -> Result<Arc<Self>> {
        let pool = Self::open(&config).await?;
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            config,
            pool: RwLock::new(pool),
            heartbeat: StdMutex::new(None),
            shutdown,
        });
        manager.spawn_heartbeat();
        Ok(manager)
    }

    async fn open(config: &DbConfig) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(pool)
    }

    pub async fn migrate(&self) -> Result<()> {
        let pool = self.pool().await;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(())
    }

    /// Clone of the current handle; survives a later swap.
    pub async fn pool(&self) -> MySqlPool {
        self.pool.read().await.clone()
    }

    pub async fn begin(&self) -> Result<Transaction<'static, MySql>> {
        let pool = self.pool().await;
        Ok(pool.begin().await?)
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                match manager.heartbeat_once().await {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            failures = consecutive_failures,
                            error = %e,
                            "database heartbeat failed"
                        );
                        if consecutive_failures >= HEARTBEAT_FAILURE_THRESHOLD {
                            if let Err(e) = manager.reconnect().await {
                                error!(error = %e, "database reconnect exhausted");
                            } else {
                                consecutive_failures = 0;
                            }
                        }
                    }
                }
            }
        });
        *self.heartbeat.lock().unwrap() = Some(task);
    }

    async fn heartbeat_once(&self) -> Result<()> {
        let pool = self.pool().await;
        sqlx::query("SELECT 1").execute(&pool).await?;

        let size = pool.size();
        let idle = pool.num_idle();
        debug!(size, idle, max = self.config.max_connections, "database pool stats");

        let in_use = size.saturating_sub(idle as u32);
        let usage = in_use as f64 / self.config.max_connections.max(1) as f64 * 100.0;
        if usage >= USAGE_WARN_PERCENT {
            warn!(usage_percent = usage as u64, "database pool usage high");
        }
        Ok(())
    }

    /// Up to five dial attempts spaced five seconds apart; the handle is
    /// swapped atomically on the first success.
    pub async fn reconnect(&self) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=RECONNECT_ATTEMPTS {
            info!(attempt, "attempting database reconnect");
            match Self::open(&self.config).await {
                Ok(fresh) => {
                    let mut guard = self.pool.write().await;
                    let old = std::mem::replace(&mut *guard, fresh);
                    drop(guard);
                    old.close().await;
                    info!(attempt, "database reconnected");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
        Err(DbError::ReconnectFailed {
            attempts: RECONNECT_ATTEMPTS,
            last_error,
        })
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.heartbeat.lock().unwrap().take() {
            task.abort();
        }
        self.pool.read().await.close().await;
        info!("database manager shut down");
    }
}

/// Retry a read-only query up to three times with jitter.
pub async fn with_read_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..3 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ DbError::Sqlx(_)) => {
                let jitter = rand::thread_rng().gen_range(100..400);
                debug!(attempt, error = %e, "read query failed, retrying");
                last = Some(e);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("at least one attempt recorded"))
}
