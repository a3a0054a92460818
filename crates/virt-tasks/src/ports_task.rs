//! create-port-mapping / delete-port-mapping handlers
//!
//! Rows are written `pending` and flip `active` only after the remote apply
//! confirms; a crash in between leaves a `pending` row the allocator still
//! treats as reserved.

use serde_json::json;
use tracing::warn;

use virt_db::{InstanceRepo, NewPortMapping, PortMappingRepo};
use virt_resources::{MappingParams, PortPlanner, ResourceError};
use virt_types::{
    BackendKind, DeletePortMappingPayload, MappingStatus, PortMappingPayload,
};

use crate::context::{HandlerOutcome, TaskContext};
use crate::error::{Result, TaskError};

pub async fn run_create(ctx: &TaskContext) -> Result<HandlerOutcome> {
    let payload: PortMappingPayload = ctx.payload()?;
    let pool = ctx.pool().await;
    let backend = ctx.backend(payload.provider_id).await?;
    let kind = backend.kind()?;
    let instance = InstanceRepo::get(&pool, payload.instance_id).await?;

    if kind == BackendKind::Docker {
        return Err(virt_backends::DriverError::Unsupported(
            "docker publishes ports at container create; changing them requires a recreate"
                .to_string(),
        )
        .into());
    }

    ctx.progress(10, "checking port availability").await;
    if let Some(existing) = PortMappingRepo::find_conflict(
        &pool,
        payload.provider_id,
        payload.host_port,
        payload.protocol,
    )
    .await?
    {
        return Err(ResourceError::PortConflict {
            host_port: existing.host_port as u16,
            protocol: existing.protocol.clone(),
        }
        .into());
    }

    let guest_ip = if payload.ipv6_enabled {
        instance.ipv6.clone()
    } else {
        instance.private_ip.clone()
    }
    .ok_or_else(|| {
        TaskError::Payload(format!(
            "instance {} has no address to map ports to",
            instance.name
        ))
    })?;

    ctx.progress(30, "recording mapping").await;
    let row_id = PortMappingRepo::insert(
        &pool,
        &NewPortMapping {
            instance_id: payload.instance_id,
            provider_id: payload.provider_id,
            host_port: payload.host_port,
            guest_port: payload.guest_port,
            protocol: payload.protocol,
            mapping_method: payload.mapping_method,
            status: MappingStatus::Pending,
            is_ssh: payload.is_ssh,
            is_automatic: payload.is_automatic,
            port_type: payload.port_type,
            ipv6_enabled: payload.ipv6_enabled,
        },
    )
    .await?;

    ctx.progress(60, "applying on backend").await;
    let ssh = ctx.drivers.ssh(&backend).await?;
    let params = MappingParams {
        instance_name: &instance.name,
        cli: kind.cli_name(),
        host_ip: backend.port_ip.as_deref(),
        guest_ip: &guest_ip,
        host_port: payload.host_port,
        guest_port: payload.guest_port,
        protocol: payload.protocol,
        ipv6: payload.ipv6_enabled,
    };
    match PortPlanner::apply(&ssh, payload.mapping_method, &params).await {
        Ok(()) => {
            PortMappingRepo::set_status(&pool, row_id, MappingStatus::Active).await?;
        }
        Err(e) => {
            PortMappingRepo::set_status(&pool, row_id, MappingStatus::Failed).await?;
            return Err(e.into());
        }
    }

    if payload.is_ssh {
        InstanceRepo::update_ssh_port(&pool, payload.instance_id, payload.host_port).await?;
    }

    Ok(HandlerOutcome::with_data(
        format!(
            "port {}→{}/{} mapped for {}",
            payload.host_port, payload.guest_port, payload.protocol, instance.name
        ),
        json!({ "mapping_id": row_id }),
    ))
}

pub async fn run_delete(ctx: &TaskContext) -> Result<HandlerOutcome> {
    let payload: DeletePortMappingPayload = ctx.payload()?;
    let pool = ctx.pool().await;
    let mapping = PortMappingRepo::get(&pool, payload.mapping_id).await?;
    let backend = ctx.backend(mapping.provider_id).await?;
    let kind = backend.kind()?;

    ctx.progress(30, "removing remote rules").await;
    // The instance may already be soft-deleted; remote removal is then moot
    match InstanceRepo::get(&pool, mapping.instance_id).await {
        Ok(instance) => {
            let ssh = ctx.drivers.ssh(&backend).await?;
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
            PortPlanner::remove(&ssh, mapping.mapping_method()?, &params).await?;
        }
        Err(e) => {
            warn!(mapping = mapping.id, error = %e, "instance gone, removing row only");
        }
    }

    ctx.progress(80, "removing mapping row").await;
    PortMappingRepo::delete(&pool, mapping.id).await?;

    Ok(HandlerOutcome::message(format!(
        "port {}/{} unmapped",
        mapping.host_port, mapping.protocol
    )))
}
