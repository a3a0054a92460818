//! create-instance handler
//!
//! request → quota reservation (pending) → capacity take → image ensured on
//! the remote → guest created → network and ports configured → row moves to
//! `running` → quota confirmed. Any failure after the reservation releases
//! pending quota and capacity and leaves the row `failed` for diagnostics.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use virt_backends::{CreateRequest, ImageSource, PublishedPort};
use virt_db::{
    BackendRow, InstanceRepo, NewInstance, NewPortMapping, PortMappingRepo, SystemImageRepo,
};
use virt_resources::{
    CapacityService, MappingParams, PortAllocator, PortPlanner, QuotaService,
};
use virt_types::{
    BackendKind, CreateInstancePayload, InstanceNameValidator, InstanceStatus, MappingStatus,
    PortMappingMethod, PortRequest, ResourceVector,
};

use crate::context::{HandlerOutcome, TaskContext};
use crate::error::{Result, TaskError};

struct PlannedPort {
    host_port: u16,
    request: PortRequest,
}

pub async fn run(ctx: &TaskContext) -> Result<HandlerOutcome> {
    let payload: CreateInstancePayload = ctx.payload()?;
    let pool = ctx.pool().await;
    let backend = ctx.backend(payload.provider_id).await?;

    InstanceNameValidator::default().validate(&payload.spec.name)?;
    if backend.is_frozen {
        return Err(TaskError::Forbidden(format!(
            "backend {} is frozen ({})",
            backend.name, backend.frozen_reason
        )));
    }
    if InstanceRepo::find_by_name(&pool, backend.id, &payload.spec.name)
        .await?
        .is_some()
    {
        return Err(TaskError::Payload(format!(
            "instance name {} already in use on this backend",
            payload.spec.name
        )));
    }

    ctx.progress(5, "reserving resources").await;
    let resources = payload.spec.resources;
    let instance_id = reserve_and_insert(ctx, &payload, &backend, &resources).await?;

    match provision(ctx, &payload, &backend, instance_id).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            rollback_failed_create(ctx, &payload, &backend, &resources, instance_id).await;
            Err(e)
        }
    }
}

async fn reserve_and_insert(
    ctx: &TaskContext,
    payload: &CreateInstancePayload,
    backend: &BackendRow,
    resources: &ResourceVector,
) -> Result<i64> {
    let mut tx = ctx.db.begin().await?;
    let limits = QuotaService::reserve_pending(&mut tx, payload.user_id, resources).await?;
    CapacityService::reserve(&mut tx, backend.id, resources).await?;

    let expires_at = Utc::now() + ChronoDuration::days(limits.expiry_days as i64);
    let instance_id = InstanceRepo::insert(
        &mut *tx,
        &NewInstance {
            uuid: Uuid::new_v4().to_string(),
            user_id: payload.user_id,
            provider_id: backend.id,
            provider_name: backend.name.clone(),
            name: payload.spec.name.clone(),
            kind: payload.spec.kind,
            resources: *resources,
            image: payload.spec.image.clone(),
            image_url: payload.spec.image_url.clone(),
            os: payload.spec.os.clone(),
            status: InstanceStatus::Creating,
            expires_at: Some(expires_at),
            is_manual_expiry: false,
            max_traffic_mb: limits.max_traffic_mb,
        },
    )
    .await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;
    Ok(instance_id)
}

async fn provision(
    ctx: &TaskContext,
    payload: &CreateInstancePayload,
    backend: &BackendRow,
    instance_id: i64,
) -> Result<HandlerOutcome> {
    let pool = ctx.pool().await;
    let kind = backend.kind()?;
    let network_type = backend.network_type()?;
    let driver = ctx.drivers.driver(backend).await?;

    ctx.progress(15, "preparing image").await;
    let image_row = SystemImageRepo::get(&pool, payload.system_image_id).await?;
    let image = ImageSource {
        name: image_row.name.clone(),
        url: image_row.url.clone(),
        architecture: image_row.architecture.clone(),
        instance_kind: payload.spec.kind,
        os: image_row.os.clone(),
    };

    // Plan host ports up front: Docker needs them inside the create request
    let planned = if network_type.is_nat() || network_type.is_ipv6_only() {
        let mut requests = vec![PortRequest::ssh()];
        requests.extend(payload.ports.iter().filter(|p| !p.is_ssh).cloned());
        if network_type.is_ipv6_only() {
            requests.truncate(1);
        }
        let host_ports = PortAllocator::allocate(&pool, backend, requests.len()).await?;
        host_ports
            .into_iter()
            .zip(requests)
            .map(|(host_port, request)| PlannedPort { host_port, request })
            .collect()
    } else {
        Vec::new()
    };

    ctx.progress(30, "creating instance on backend").await;
    let request = CreateRequest {
        spec: payload.spec.clone(),
        image,
        password: None,
        publish_ports: if kind == BackendKind::Docker {
            planned
                .iter()
                .map(|p| PublishedPort {
                    host_port: p.host_port,
                    guest_port: p.request.guest_port,
                    protocol: p.request.protocol,
                })
                .collect()
        } else {
            Vec::new()
        },
        configure_ipv6: network_type.has_ipv6(),
    };
    let created = driver.create_instance(&request).await?;

    ctx.progress(60, "configuring network").await;
    InstanceRepo::update_network(
        &pool,
        instance_id,
        created.private_ip.as_deref(),
        created.ipv6.as_deref(),
        created.mac.as_deref(),
    )
    .await?;

    let warnings = apply_port_plan(ctx, backend, instance_id, &created.private_ip, &created.ipv6, &planned)
        .await?;

    ctx.progress(85, "finalising").await;
    let mut tx = ctx.db.begin().await?;
    InstanceRepo::set_running(&mut *tx, instance_id, created.private_ip.as_deref()).await?;
    QuotaService::confirm_pending(&mut tx, payload.user_id, &payload.spec.resources).await?;
    tx.commit().await.map_err(virt_db::DbError::from)?;

    let message = if warnings.is_empty() {
        format!("instance {} created", payload.spec.name)
    } else {
        format!(
            "instance {} created with warnings: {}",
            payload.spec.name,
            warnings.join("; ")
        )
    };
    Ok(HandlerOutcome::with_data(
        message,
        json!({ "instance_id": instance_id }),
    ))
}

/// Record mapping rows and realise them remotely. The SSH mapping is
/// load-bearing (the row invariant requires it on every running NAT
/// instance), so its failure fails the create; extra ports degrade to
/// warnings.
async fn apply_port_plan(
    ctx: &TaskContext,
    backend: &BackendRow,
    instance_id: i64,
    private_ip: &Option<String>,
    ipv6: &Option<String>,
    planned: &[PlannedPort],
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    if planned.is_empty() {
        return Ok(warnings);
    }

    let pool = ctx.pool().await;
    let kind = backend.kind()?;
    let network_type = backend.network_type()?;
    let ipv6_only = network_type.is_ipv6_only();

    let method = if kind == BackendKind::Docker {
        // Ports were published at create; rows are recorded as externally
        // managed
        PortMappingMethod::Native
    } else if ipv6_only {
        backend.ipv6_mapping_method()?
    } else {
        backend.ipv4_mapping_method()?
    };

    let guest_ip = if ipv6_only {
        ipv6.clone()
    } else {
        private_ip.clone()
    };

    let ssh = ctx.drivers.ssh(backend).await?;
    let instance = InstanceRepo::get(&pool, instance_id).await?;

    for plan in planned {
        let row_id = PortMappingRepo::insert(
            &pool,
            &NewPortMapping {
                instance_id,
                provider_id: backend.id,
                host_port: plan.host_port,
                guest_port: plan.request.guest_port,
                protocol: plan.request.protocol,
                mapping_method: method,
                status: if kind == BackendKind::Docker {
                    MappingStatus::Active
                } else {
                    MappingStatus::Pending
                },
                is_ssh: plan.request.is_ssh,
                is_automatic: true,
                port_type: plan.request.port_type,
                ipv6_enabled: ipv6_only,
            },
        )
        .await?;

        if kind != BackendKind::Docker {
            let guest_ip = guest_ip.as_deref().ok_or_else(|| {
                TaskError::Payload("instance has no address to map ports to".to_string())
            })?;
            let params = MappingParams {
                instance_name: &instance.name,
                cli: kind.cli_name(),
                host_ip: backend.port_ip.as_deref(),
                guest_ip,
                host_port: plan.host_port,
                guest_port: plan.request.guest_port,
                protocol: plan.request.protocol,
                ipv6: ipv6_only,
            };
            match PortPlanner::apply(&ssh, method, &params).await {
                Ok(()) => {
                    PortMappingRepo::set_status(&pool, row_id, MappingStatus::Active).await?;
                }
                Err(e) if plan.request.is_ssh => {
                    PortMappingRepo::set_status(&pool, row_id, MappingStatus::Failed).await?;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(host_port = plan.host_port, error = %e, "port mapping apply failed");
                    PortMappingRepo::set_status(&pool, row_id, MappingStatus::Failed).await?;
                    warnings.push(format!("port {} failed: {}", plan.host_port, e));
                }
            }
        }

        if plan.request.is_ssh {
            InstanceRepo::update_ssh_port(&pool, instance_id, plan.host_port).await?;
        }
    }

    // Contiguous extra allocations are also recorded as the instance range
    let extra: Vec<u16> = planned
        .iter()
        .filter(|p| !p.request.is_ssh)
        .map(|p| p.host_port)
        .collect();
    if let [(start, end)] = PortAllocator::coalesce(&extra)[..] {
        if start != end {
            InstanceRepo::update_port_range(&pool, instance_id, start, end).await?;
        }
    }

    Ok(warnings)
}

async fn rollback_failed_create(
    ctx: &TaskContext,
    payload: &CreateInstancePayload,
    backend: &BackendRow,
    resources: &ResourceVector,
    instance_id: i64,
) {
    let release = async {
        let mut tx = ctx.db.begin().await?;
        QuotaService::release_pending(&mut tx, payload.user_id, resources).await?;
        CapacityService::release(&mut tx, backend.id, resources).await?;
        InstanceRepo::update_status(&mut *tx, instance_id, InstanceStatus::Failed).await?;
        tx.commit().await.map_err(virt_db::DbError::from)?;
        Ok::<_, TaskError>(())
    };
    if let Err(e) = release.await {
        warn!(
            instance_id,
            error = %e,
            "failed to release reservations after create failure"
        );
    }
}
