//! Expiry-freeze pass
//!
//! Every tick: freeze expired users, then expired backends (cascading to
//! their automatic-expiry instances with reason `node_frozen`), then
//! expired instances. Setting a fresh future expiry on a resource frozen
//! *for that reason* thaws it; manual freezes for other reasons stay put.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPool;
use tracing::info;

use virt_db::{BackendRepo, DbManager, InstanceRepo, QuotaRepo};

use crate::error::Result;
use crate::runner::Job;

pub const REASON_EXPIRED: &str = "expired";
pub const REASON_NODE_FROZEN: &str = "node_frozen";

pub struct ExpiryFreezeJob {
    db: Arc<DbManager>,
}

impl ExpiryFreezeJob {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    async fn freeze_users(&self, pool: &MySqlPool, now: DateTime<Utc>) -> Result<u64> {
        let mut frozen = 0;
        for user in QuotaRepo::list_expired_users(pool, now).await? {
            QuotaRepo::freeze_user(pool, user.id).await?;
            frozen += 1;
        }
        Ok(frozen)
    }

    async fn freeze_backends(&self, now: DateTime<Utc>) -> Result<u64> {
        let pool = self.db.pool().await;
        let expired = BackendRepo::list_expired(&pool, now).await?;
        let mut frozen = 0;
        for backend in expired {
            // The backend and its cascade land in one transaction
            let mut tx = self.db.begin().await?;
            BackendRepo::freeze(&mut *tx, backend.id, REASON_EXPIRED, now).await?;
            let cascaded =
                InstanceRepo::freeze_cascade(&mut *tx, backend.id, REASON_NODE_FROZEN).await?;
            tx.commit().await.map_err(virt_db::DbError::from)?;
            info!(
                backend = %backend.name,
                cascaded,
                "froze expired backend and its automatic-expiry instances"
            );
            frozen += 1;
        }
        Ok(frozen)
    }

    async fn freeze_instances(&self, pool: &MySqlPool, now: DateTime<Utc>) -> Result<u64> {
        let mut frozen = 0;
        for instance in InstanceRepo::list_expired(pool, now).await? {
            if InstanceRepo::freeze(pool, instance.id, REASON_EXPIRED).await? {
                info!(instance = %instance.name, "froze expired instance");
                frozen += 1;
            }
        }
        Ok(frozen)
    }
}

#[async_trait]
impl Job for ExpiryFreezeJob {
    fn name(&self) -> &'static str {
        "expiry-freeze"
    }

    async fn run(&self) -> Result<()> {
        let now = Utc::now();
        let pool = self.db.pool().await;
        let users = self.freeze_users(&pool, now).await?;
        let backends = self.freeze_backends(now).await?;
        let instances = self.freeze_instances(&pool, now).await?;
        if users + backends + instances > 0 {
            info!(users, backends, instances, "expiry-freeze pass complete");
        }
        Ok(())
    }
}

/// Expiry updates with the same-reason auto-thaw semantics
pub struct ExpiryService;

impl ExpiryService {
    pub async fn set_instance_expiry(
        pool: &MySqlPool,
        instance_id: i64,
        expires_at: Option<DateTime<Utc>>,
        is_manual: bool,
    ) -> Result<()> {
        InstanceRepo::set_expiry(pool, instance_id, expires_at, is_manual).await?;
        if matches!(expires_at, Some(at) if at > Utc::now()) {
            if InstanceRepo::thaw_if_reason(pool, instance_id, REASON_EXPIRED).await? {
                info!(instance_id, "thawed instance after expiry extension");
            }
        }
        Ok(())
    }

    pub async fn set_backend_expiry(
        pool: &MySqlPool,
        backend_id: i64,
        expires_at: Option<DateTime<Utc>>,
        is_manual: bool,
    ) -> Result<()> {
        BackendRepo::set_expiry(pool, backend_id, expires_at, is_manual).await?;
        if matches!(expires_at, Some(at) if at > Utc::now())
            && BackendRepo::thaw_if_reason(pool, backend_id, REASON_EXPIRED).await?
        {
            let cascaded = InstanceRepo::thaw_cascade(pool, backend_id, REASON_NODE_FROZEN).await?;
            info!(backend_id, cascaded, "thawed backend and cascade after expiry extension");
        }
        Ok(())
    }
}
