//! The task engine: submission, per-backend pools, dispatch, cancellation

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use virt_db::{BackendRepo, DbManager, NewTask, TaskRepo};
use virt_types::{DeletePortMappingPayload, TaskStatus, TaskType};

use crate::context::{DriverProvider, EngineConfig, HandlerOutcome, TaskContext};
use crate::error::{Result, TaskError};
use crate::pool::{TaskRunner, WorkerPool};
use crate::{create, delete, ports_task, reset};

/// Tasks without a provider (none today, but payloads allow it) share one
/// serial pool under this key.
const UNPOOLED: i64 = 0;

struct PoolEntry {
    concurrency: usize,
    pool: Arc<WorkerPool>,
}

struct EngineInner {
    db: Arc<DbManager>,
    drivers: Arc<dyn DriverProvider>,
    config: EngineConfig,
    pools: DashMap<i64, PoolEntry>,
    running: DashMap<String, watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(db: Arc<DbManager>, drivers: Arc<dyn DriverProvider>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                db,
                drivers,
                config,
                pools: DashMap::new(),
                running: DashMap::new(),
            }),
        }
    }

    /// Persist a task record and hand it to its backend's pool.
    pub async fn submit(&self, mut new: NewTask) -> Result<String> {
        if new.uuid.is_empty() {
            new.uuid = Uuid::new_v4().to_string();
        }
        if new.timeout_seconds <= 0 {
            new.timeout_seconds = self.inner.config.default_timeout_secs;
        }
        let pool = self.inner.db.pool().await;
        TaskRepo::insert(&pool, &new).await?;
        info!(task = %new.uuid, task_type = %new.task_type, "task submitted");
        self.enqueue(new.provider_id, new.uuid.clone()).await?;
        Ok(new.uuid)
    }

    /// Batch port delete: one standard delete-port-mapping task per id.
    pub async fn submit_batch_port_delete(
        &self,
        user_id: i64,
        mappings: Vec<DeletePortMappingPayload>,
    ) -> Result<Vec<String>> {
        let mut uuids = Vec::with_capacity(mappings.len());
        for payload in mappings {
            let uuid = self
                .submit(NewTask {
                    uuid: String::new(),
                    user_id,
                    provider_id: Some(payload.provider_id),
                    instance_id: Some(payload.instance_id),
                    task_type: TaskType::DeletePortMapping,
                    payload: serde_json::to_value(&payload)?,
                    timeout_seconds: 300,
                    is_force_stoppable: true,
                })
                .await?;
            uuids.push(uuid);
        }
        Ok(uuids)
    }

    pub async fn enqueue(&self, provider_id: Option<i64>, uuid: String) -> Result<()> {
        let (key, concurrency) = match provider_id {
            Some(id) => {
                let pool = self.inner.db.pool().await;
                let backend = BackendRepo::get(&pool, id).await?;
                (id, backend.concurrency())
            }
            None => (UNPOOLED, 1),
        };
        let pool = self.pool_for(key, concurrency);
        if !pool.submit(uuid.clone()).await {
            warn!(task = %uuid, "pool rejected task, re-submitting on rebuilt pool");
            self.inner.pools.remove(&key);
            let pool = self.pool_for(key, concurrency);
            let _ = pool.submit(uuid).await;
        }
        Ok(())
    }

    /// Lazily created; a concurrency (policy) change drops the old pool —
    /// letting queued work drain — and builds a fresh one at the new width.
    fn pool_for(&self, key: i64, concurrency: usize) -> Arc<WorkerPool> {
        let desired = concurrency.max(1);
        if let Some(entry) = self.inner.pools.get(&key) {
            if entry.concurrency == desired {
                return entry.pool.clone();
            }
            debug!(provider = key, concurrency = desired, "rebuilding worker pool");
        }
        let pool = Arc::new(WorkerPool::new(desired, self.runner()));
        self.inner.pools.insert(
            key,
            PoolEntry {
                concurrency: desired,
                pool: pool.clone(),
            },
        );
        pool
    }

    fn runner(&self) -> TaskRunner {
        let inner = self.inner.clone();
        Arc::new(move |uuid| {
            let inner = inner.clone();
            Box::pin(async move {
                run_task(inner, uuid).await;
            })
        })
    }

    /// External cancel. Consults `is_force_stoppable`, moves the row to
    /// `cancelled`, and fires the registered context so an in-flight handler
    /// aborts at its next await point.
    pub async fn cancel(&self, uuid: &str) -> Result<bool> {
        let pool = self.inner.db.pool().await;
        let cancelled = TaskRepo::cancel(&pool, uuid, Utc::now()).await?;
        if cancelled {
            if let Some((_, tx)) = self.inner.running.remove(uuid) {
                let _ = tx.send(true);
            }
            info!(task = %uuid, "task cancelled");
        }
        Ok(cancelled)
    }

    /// Boot-time recovery: tasks left `running` by a dead process are reaped
    /// to `failed`; `pending` tasks re-enter their queues.
    pub async fn recover(&self) -> Result<(u64, usize)> {
        let pool = self.inner.db.pool().await;
        let reaped = TaskRepo::reap_running(&pool, Utc::now()).await?;
        if reaped > 0 {
            warn!(reaped, "reaped tasks left running by a previous process");
        }
        let pending = TaskRepo::list_pending(&pool).await?;
        let count = pending.len();
        for task in pending {
            self.enqueue(task.provider_id, task.uuid).await?;
        }
        if count > 0 {
            info!(count, "re-enqueued pending tasks");
        }
        Ok((reaped, count))
    }

    /// Graceful shutdown: drop every pool, which lets queued and in-flight
    /// work drain within their own timeouts.
    pub async fn shutdown(&self) {
        self.inner.pools.clear();
        info!("task engine shut down");
    }
}

async fn dispatch(ctx: &TaskContext) -> Result<HandlerOutcome> {
    match ctx.task.task_type()? {
        TaskType::CreateInstance => create::run(ctx).await,
        TaskType::DeleteInstance => delete::run(ctx).await,
        TaskType::ResetInstance => reset::run(ctx).await,
        TaskType::CreatePortMapping => ports_task::run_create(ctx).await,
        TaskType::DeletePortMapping => ports_task::run_delete(ctx).await,
    }
}

async fn run_task(inner: Arc<EngineInner>, uuid: String) {
    // Claim under a row lock; exactly one worker wins a given task
    let claimed = async {
        let mut tx = inner.db.begin().await?;
        let claimed = TaskRepo::claim(&mut tx, &uuid, Utc::now()).await?;
        tx.commit().await.map_err(virt_db::DbError::from)?;
        Ok::<_, TaskError>(claimed)
    }
    .await;

    let task = match claimed {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!(task = %uuid, "task no longer pending, skipping");
            return;
        }
        Err(e) => {
            warn!(task = %uuid, error = %e, "task claim failed");
            return;
        }
    };

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    inner.running.insert(uuid.clone(), cancel_tx);

    let timeout_secs = task.timeout_seconds.max(1) as u64;
    let ctx = TaskContext {
        db: inner.db.clone(),
        drivers: inner.drivers.clone(),
        config: inner.config.clone(),
        task,
    };

    // The handler runs in its own task so a panic is contained and surfaces
    // as a failed terminal state instead of taking the worker down
    let mut handler = tokio::spawn(async move { dispatch(&ctx).await });

    let result: Result<HandlerOutcome> = tokio::select! {
        joined = &mut handler => match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(task = %uuid, panic = %message, "task handler panicked");
                Err(TaskError::Panic(message))
            }
            Err(_) => Err(TaskError::Cancelled),
        },
        changed = cancel_rx.changed() => {
            if changed.is_ok() {
                handler.abort();
                Err(TaskError::Cancelled)
            } else {
                // Sender dropped without firing; wait for the handler
                match handler.await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Cancelled),
                }
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
            handler.abort();
            Err(TaskError::Timeout { seconds: timeout_secs })
        }
    };

    inner.running.remove(&uuid);

    let pool = inner.db.pool().await;
    let now = Utc::now();
    match result {
        Ok(outcome) => {
            let data = json!({
                "message": outcome.message,
                "data": outcome.data,
            });
            let _ = TaskRepo::update_progress(&pool, &uuid, 100, &outcome.message).await;
            if let Err(e) =
                TaskRepo::finish(&pool, &uuid, TaskStatus::Completed, None, Some(&data), now).await
            {
                warn!(task = %uuid, error = %e, "failed to record task completion");
            }
        }
        Err(TaskError::Cancelled) => {
            // The cancel path already wrote the terminal row
            debug!(task = %uuid, "task cancelled mid-flight");
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(we) = TaskRepo::finish(
                &pool,
                &uuid,
                TaskStatus::Failed,
                Some(&message),
                None,
                now,
            )
            .await
            {
                warn!(task = %uuid, error = %we, "failed to record task failure");
            }
        }
    }
}
