//! reset-instance handler
//!
//! A reset is "delete old + create new" preserving identity: name, owner,
//! expiry, traffic allowance, image, and the multiset of port mappings. The
//! old row is renamed `<name>_deleted_<unix>` to free the uniqueness
//! constraint; the replacement is a new row with a new id.

use std::time::Duration;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use virt_backends::{BackendDriver, CreateRequest, ImageSource, PublishedPort};
use virt_db::{
    BackendRow, InstanceRepo, NewInstance, NewPortMapping, PortMappingRepo, PortMappingRow,
    SystemImageRepo,
};
use virt_resources::{CapacityService, MappingParams, PortPlanner, QuotaService};
use virt_types::{
    BackendKind, InstanceSpec, InstanceStatus, MappingStatus, ResetInstancePayload,
};

use crate::context::{HandlerOutcome, TaskContext};
use crate::error::{Result, TaskError};

const POST_DELETE_SETTLE: Duration = Duration::from_secs(10);
const POST_CREATE_SETTLE: Duration = Duration::from_secs(15);
const IP_WAIT_BUDGET: Duration = Duration::from_secs(30);
const IP_POLL_INTERVAL: Duration = Duration::from_secs(3);
const FALLBACK_PASSWORD: &str = "root";

pub async fn run(ctx: &TaskContext) -> Result<HandlerOutcome> {
    let payload: ResetInstancePayload = ctx.payload()?;
    let pool = ctx.pool().await;

    // 5%: prepare — everything the rebuild needs, snapshotted up front
    ctx.progress(5, "preparing reset").await;
    let old = InstanceRepo::get(&pool, payload.instance_id).await?;
    if old.user_id != ctx.task.user_id && ctx.task.user_id != 0 {
        return Err(TaskError::Forbidden(format!(
            "instance {} belongs to another user",
            old.name
        )));
    }
    let backend = ctx.backend(old.provider_id).await?;
    let kind = backend.kind()?;
    let old_status = old.status()?;
    let old_mappings = PortMappingRepo::list_for_instance(&pool, old.id).await?;
    let image_row = SystemImageRepo::find(&pool, kind, old.kind()?, &old.os, &backend.architecture)
        .await?
        .ok_or_else(|| {
            TaskError::Payload(format!(
                "no active system image for {}/{}/{}",
                kind,
                old.kind().map(|k| k.as_str()).unwrap_or("?"),
                old.os
            ))
        })?;
    let name = old.name.clone();
    let resources = old.resources();
    let driver = ctx.drivers.driver(&backend).await?;

    // 15%: remote delete; a guest that is already gone is fine
    ctx.progress(15, "deleting old instance on backend").await;
    match driver.delete_instance(&name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    tokio::time::sleep(POST_DELETE_SETTLE).await;

    // 25%: cleanup — rename frees (provider_id, name) for the replacement
    ctx.progress(25, "cleaning up old records").await;
    let mut tx = ctx.db.begin().await?;
    InstanceRepo::rename_and_soft_delete(&mut *tx, old.id, Utc::now()).await?;
    CapacityService::release(&mut tx, backend.id, &resources).await?;
    QuotaService::release_for_status(&mut tx, old.user_id, &resources, old_status).await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;
    detach_traffic_monitor(driver.as_ref(), &backend, &name).await;

    // 40%: replacement row, pending quota, capacity
    ctx.progress(40, "creating replacement record").await;
    let mut tx = ctx.db.begin().await?;
    QuotaService::reserve_pending(&mut tx, old.user_id, &resources).await?;
    CapacityService::reserve(&mut tx, backend.id, &resources).await?;
    let new_id = InstanceRepo::insert(
        &mut *tx,
        &NewInstance {
            uuid: Uuid::new_v4().to_string(),
            user_id: old.user_id,
            provider_id: backend.id,
            provider_name: backend.name.clone(),
            name: name.clone(),
            kind: old.kind()?,
            resources,
            image: image_row.name.clone(),
            image_url: Some(image_row.url.clone()),
            os: old.os.clone(),
            status: InstanceStatus::Creating,
            expires_at: old.expires_at,
            is_manual_expiry: old.is_manual_expiry,
            max_traffic_mb: old.max_traffic_mb,
        },
    )
    .await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;

    // 50%: driver create. Docker re-publishes the old ports here.
    ctx.progress(50, "creating instance on backend").await;
    let request = CreateRequest {
        spec: InstanceSpec {
            name: name.clone(),
            kind: old.kind()?,
            resources,
            image: image_row.name.clone(),
            image_url: Some(image_row.url.clone()),
            os: old.os.clone(),
        },
        image: ImageSource {
            name: image_row.name.clone(),
            url: image_row.url.clone(),
            architecture: image_row.architecture.clone(),
            instance_kind: old.kind()?,
            os: image_row.os.clone(),
        },
        password: None,
        publish_ports: if kind == BackendKind::Docker {
            old_mappings
                .iter()
                .filter_map(|m| {
                    Some(PublishedPort {
                        host_port: m.host_port as u16,
                        guest_port: m.guest_port as u16,
                        protocol: m.protocol().ok()?,
                    })
                })
                .collect()
        } else {
            Vec::new()
        },
        configure_ipv6: backend.network_type()?.has_ipv6(),
    };
    let created = match driver.create_instance(&request).await {
        Ok(created) => created,
        Err(e) => {
            // The failed row stays for diagnostics; its reservations do not
            fail_replacement(ctx, &backend, old.user_id, &resources, new_id).await;
            return Err(e.into());
        }
    };
    tokio::time::sleep(POST_CREATE_SETTLE).await;
    if let Ok(current) = driver.get_instance(&name).await {
        if current.status != "running" {
            if let Err(e) = driver.start_instance(&name).await {
                warn!(instance = %name, error = %e, "post-create start failed");
            }
        }
    }

    // 70%: password, retried, with a sentinel fallback
    ctx.progress(70, "setting password").await;
    let password = set_password_with_retry(ctx, driver.as_ref(), &name).await;

    // 80%: running + pending → used
    ctx.progress(80, "confirming resources").await;
    let mut tx = ctx.db.begin().await?;
    InstanceRepo::set_running(&mut *tx, new_id, created.private_ip.as_deref()).await?;
    QuotaService::confirm_pending(&mut tx, old.user_id, &resources).await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;

    // 88%: restore the old port mappings onto the new guest
    ctx.progress(88, "restoring port mappings").await;
    let warnings = restore_ports(
        ctx,
        &backend,
        driver.as_ref(),
        &name,
        new_id,
        created.private_ip.clone(),
        &old_mappings,
    )
    .await?;

    // 96%: traffic monitor
    ctx.progress(96, "re-attaching traffic monitor").await;
    if backend.enable_traffic_control {
        attach_traffic_monitor(driver.as_ref(), &name).await;
    }

    info!(instance = %name, old_id = old.id, new_id, "instance reset complete");
    let mut message = format!("instance {} reset (new id {})", name, new_id);
    if !warnings.is_empty() {
        message.push_str(&format!("; warnings: {}", warnings.join("; ")));
    }
    Ok(HandlerOutcome::with_data(
        message,
        json!({ "old_instance_id": old.id, "new_instance_id": new_id, "password": password }),
    ))
}

async fn fail_replacement(
    ctx: &TaskContext,
    backend: &BackendRow,
    user_id: i64,
    resources: &virt_types::ResourceVector,
    new_id: i64,
) {
    let release = async {
        let mut tx = ctx.db.begin().await?;
        InstanceRepo::update_status(&mut *tx, new_id, InstanceStatus::Failed).await?;
        QuotaService::release_pending(&mut tx, user_id, resources).await?;
        CapacityService::release(&mut tx, backend.id, resources).await?;
        tx.commit().await.map_err(virt_db::DbError::from)?;
        Ok::<_, TaskError>(())
    };
    if let Err(e) = release.await {
        warn!(new_id, error = %e, "failed to settle reservations after create failure");
    }
}

/// Three attempts with a linear back-off; total failure logs and falls back
/// to the `root` sentinel so the reset still completes.
async fn set_password_with_retry(
    ctx: &TaskContext,
    driver: &dyn BackendDriver,
    name: &str,
) -> String {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();

    let attempts = ctx.config.password_retry_count.max(1);
    for attempt in 1..=attempts {
        match driver.set_password(name, "root", &password).await {
            Ok(()) => return password,
            Err(e) => {
                warn!(instance = name, attempt, error = %e, "password set failed");
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(3 * attempt as u64)).await;
                }
            }
        }
    }
    warn!(instance = name, "password could not be set, using sentinel");
    FALLBACK_PASSWORD.to_string()
}

async fn restore_ports(
    ctx: &TaskContext,
    backend: &BackendRow,
    driver: &dyn BackendDriver,
    name: &str,
    new_id: i64,
    mut guest_ip: Option<String>,
    old_mappings: &[PortMappingRow],
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    if old_mappings.is_empty() {
        return Ok(warnings);
    }
    let pool = ctx.pool().await;
    let kind = backend.kind()?;

    // LXD/Incus guests pick their address up from DHCP after start; wait a
    // bounded moment before wiring proxy devices to it
    if guest_ip.is_none() && matches!(kind, BackendKind::Lxd | BackendKind::Incus) {
        let deadline = tokio::time::Instant::now() + IP_WAIT_BUDGET;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(ip)) = driver.instance_ip(name).await {
                guest_ip = Some(ip);
                break;
            }
            tokio::time::sleep(IP_POLL_INTERVAL).await;
        }
        if let Some(ip) = &guest_ip {
            InstanceRepo::update_network(&pool, new_id, Some(ip), None, None).await?;
        }
    }

    let ssh = ctx.drivers.ssh(backend).await?;
    for mapping in old_mappings {
        let row_id = PortMappingRepo::insert(
            &pool,
            &NewPortMapping {
                instance_id: new_id,
                provider_id: backend.id,
                host_port: mapping.host_port as u16,
                guest_port: mapping.guest_port as u16,
                protocol: mapping.protocol()?,
                mapping_method: mapping.mapping_method()?,
                status: if kind == BackendKind::Docker {
                    // Embedded in the create request at the 50% stage
                    MappingStatus::Active
                } else {
                    MappingStatus::Pending
                },
                is_ssh: mapping.is_ssh,
                is_automatic: mapping.is_automatic,
                port_type: mapping.port_type()?,
                ipv6_enabled: mapping.ipv6_enabled,
            },
        )
        .await?;

        if kind != BackendKind::Docker {
            let Some(ip) = guest_ip.as_deref() else {
                warnings.push(format!(
                    "port {} not restored: instance address unknown",
                    mapping.host_port
                ));
                PortMappingRepo::set_status(&pool, row_id, MappingStatus::Failed).await?;
                continue;
            };
            let params = MappingParams {
                instance_name: name,
                cli: kind.cli_name(),
                host_ip: backend.port_ip.as_deref(),
                guest_ip: ip,
                host_port: mapping.host_port as u16,
                guest_port: mapping.guest_port as u16,
                protocol: mapping.protocol()?,
                ipv6: mapping.ipv6_enabled,
            };
            match PortPlanner::apply(&ssh, mapping.mapping_method()?, &params).await {
                Ok(()) => {
                    PortMappingRepo::set_status(&pool, row_id, MappingStatus::Active).await?;
                }
                Err(e) => {
                    warn!(host_port = mapping.host_port, error = %e, "port restore failed");
                    PortMappingRepo::set_status(&pool, row_id, MappingStatus::Failed).await?;
                    warnings.push(format!("port {}: {}", mapping.host_port, e));
                }
            }
        }
    }

    // The instance's ssh_port column follows the restored SSH row
    if let Some(ssh_row) = old_mappings.iter().find(|m| m.is_ssh) {
        InstanceRepo::update_ssh_port(&pool, new_id, ssh_row.host_port as u16).await?;
    }

    Ok(warnings)
}

/// pmacct attach/detach are remote conveniences; their failure never fails
/// the umbrella task.
async fn detach_traffic_monitor(driver: &dyn BackendDriver, backend: &BackendRow, name: &str) {
    if !backend.enable_traffic_control {
        return;
    }
    if let Err(e) = driver
        .exec(&format!("rm -f /etc/pmacct/instances.d/{}.conf", name))
        .await
    {
        warn!(instance = name, error = %e, "traffic monitor detach failed");
    }
}

async fn attach_traffic_monitor(driver: &dyn BackendDriver, name: &str) {
    if let Err(e) = driver
        .exec(&format!(
            "mkdir -p /etc/pmacct/instances.d && touch /etc/pmacct/instances.d/{}.conf && \
             systemctl reload pmacctd 2>/dev/null || true",
            name
        ))
        .await
    {
        warn!(instance = name, error = %e, "traffic monitor attach failed");
    }
}
