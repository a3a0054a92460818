//! delete-instance handler
//!
//! The remote delete is retried with exponential back-off; whether or not it
//! eventually succeeded, the database cleanup proceeds in one transaction so
//! quota and capacity are never stranded. The completion message reports a
//! failed remote delete.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use virt_backends::BackendDriver;
use virt_db::{InstanceRepo, PortMappingRepo, TrafficRepo};
use virt_resources::{
    CapacityService, MappingParams, PortPlanner, QuotaService, TrafficAggregator, Window,
};
use virt_types::DeleteInstancePayload;

use crate::context::{HandlerOutcome, TaskContext};
use crate::error::{Result, TaskError};

const FINAL_SYNC_BUDGET: Duration = Duration::from_secs(15);

pub async fn run(ctx: &TaskContext) -> Result<HandlerOutcome> {
    let payload: DeleteInstancePayload = ctx.payload()?;
    let pool = ctx.pool().await;
    let instance = InstanceRepo::get(&pool, payload.instance_id).await?;

    if !payload.admin_operation && instance.user_id != ctx.task.user_id {
        return Err(TaskError::Forbidden(format!(
            "instance {} belongs to another user",
            instance.name
        )));
    }
    let backend = ctx.backend(instance.provider_id).await?;

    // Final traffic sync, bounded: the instance's counters disappear with it
    ctx.progress(10, "final traffic sync").await;
    let window = Window::month_of(Utc::now());
    let sync = TrafficAggregator::aggregate_instance(
        &pool,
        instance.id,
        &window,
        backend.traffic_count_mode()?,
        backend.traffic_multiplier,
    );
    match tokio::time::timeout(FINAL_SYNC_BUDGET, sync).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(instance = %instance.name, error = %e, "final traffic sync failed"),
        Err(_) => warn!(instance = %instance.name, "final traffic sync timed out"),
    }

    ctx.progress(30, "deleting instance on backend").await;
    let driver = ctx.drivers.driver(&backend).await?;
    let (remote_ok, remote_message) = delete_with_retry(ctx, driver.as_ref(), &instance.name).await;

    ctx.progress(60, "removing port mappings").await;
    let mappings = PortMappingRepo::list_for_instance(&pool, instance.id).await?;
    let mut warnings = Vec::new();
    if !mappings.is_empty() {
        match ctx.drivers.ssh(&backend).await {
            Ok(ssh) => {
                let kind = backend.kind()?;
                for mapping in &mappings {
                    let params = MappingParams {
                        instance_name: &instance.name,
                        cli: kind.cli_name(),
                        host_ip: backend.port_ip.as_deref(),
                        guest_ip: instance.private_ip.as_deref().unwrap_or(""),
                        host_port: mapping.host_port as u16,
                        guest_port: mapping.guest_port as u16,
                        protocol: mapping.protocol()?,
                        ipv6: mapping.ipv6_enabled,
                    };
                    if let Err(e) =
                        PortPlanner::remove(&ssh, mapping.mapping_method()?, &params).await
                    {
                        warn!(host_port = mapping.host_port, error = %e, "remote rule removal failed");
                        warnings.push(format!("port {}: {}", mapping.host_port, e));
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "ssh unavailable, leaving remote rules behind");
                warnings.push(format!("remote rules not removed: {}", e));
            }
        }
    }

    // One transaction: traffic data, mapping rows, capacity, the instance
    // row itself, and the user quota all settle together
    ctx.progress(80, "cleaning up records").await;
    let prior_status = instance.status()?;
    let resources = instance.resources();
    let mut tx = ctx.db.begin().await?;
    TrafficRepo::purge_samples(&mut *tx, instance.id).await?;
    PortMappingRepo::delete_for_instance(&mut *tx, instance.id).await?;
    CapacityService::release(&mut tx, backend.id, &resources).await?;
    InstanceRepo::rename_and_soft_delete(&mut *tx, instance.id, Utc::now()).await?;
    QuotaService::release_for_status(&mut tx, instance.user_id, &resources, prior_status).await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;

    info!(instance = %instance.name, remote_ok, "instance deleted");

    let mut message = if remote_ok {
        format!("instance {} deleted", instance.name)
    } else {
        format!(
            "instance {} records removed; remote delete failed: {}",
            instance.name, remote_message
        )
    };
    if !warnings.is_empty() {
        message.push_str(&format!(" (warnings: {})", warnings.join("; ")));
    }
    Ok(HandlerOutcome::with_data(
        message,
        json!({ "remote_deleted": remote_ok }),
    ))
}

/// `delete_retry_count` attempts with exponential back-off starting at
/// `delete_retry_delay`. A missing remote guest is success.
async fn delete_with_retry(
    ctx: &TaskContext,
    driver: &dyn BackendDriver,
    name: &str,
) -> (bool, String) {
    let attempts = ctx.config.delete_retry_count.max(1);
    let base_delay = ctx.config.delete_retry_delay_secs;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match driver.delete_instance(name).await {
            Ok(()) => return (true, "deleted".to_string()),
            Err(e) if e.is_not_found() => {
                return (true, "was already absent on the backend".to_string())
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(instance = name, attempt, error = %last_error, "remote delete failed");
                if attempt < attempts {
                    let delay = base_delay * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }
    (false, last_error)
}
