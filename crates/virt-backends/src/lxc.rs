//! LXD / Incus driver
//!
//! The two daemons expose the same REST surface and near-identical CLIs, so
//! one driver covers both, parameterised by flavour. Port mappings for this
//! family are proxy devices and belong to the planner, not the driver.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use virt_health::{HealthChecker, HealthResult};
use virt_ssh::{CommandOutput, SshClient};
use virt_types::{BackendKind, DiscoveredInstance, InstanceKind};

use crate::driver::{
    validate_create, BackendDriver, CreateRequest, CreatedInstance, ImageInfo, ImageSource,
    InstanceSpecExt,
};
use crate::error::{DriverError, Result};
use crate::images::RemoteImageStore;
use crate::policy::run_dual;
use crate::profile::BackendProfile;
use crate::rest_api::ContainerRestApi;

pub struct LinuxContainerDriver {
    profile: BackendProfile,
    ssh: Arc<SshClient>,
    api: Option<ContainerRestApi>,
    cli: &'static str,
    store: RemoteImageStore,
}

impl LinuxContainerDriver {
    pub fn new(profile: BackendProfile, ssh: Arc<SshClient>) -> Result<Self> {
        let cli = match profile.kind {
            BackendKind::Lxd => "lxc",
            BackendKind::Incus => "incus",
            other => {
                return Err(DriverError::Validation(format!(
                    "LinuxContainerDriver cannot drive a {} backend",
                    other
                )))
            }
        };
        let api = if profile.api_cert.is_some() && profile.api_cert_key.is_some() {
            Some(ContainerRestApi::new(&profile)?)
        } else {
            None
        };
        Ok(Self {
            profile,
            ssh,
            api,
            cli,
            store: RemoteImageStore::new(cli),
        })
    }

    fn api(&self) -> Result<&ContainerRestApi> {
        self.api.as_ref().ok_or_else(|| {
            DriverError::Validation("no container API client certificate".to_string())
        })
    }

    fn dual<'a, T: Send + 'a>(
        &'a self,
        operation: &'a str,
        api: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
        ssh: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
    ) -> BoxFuture<'a, Result<T>> {
        Box::pin(run_dual(
            self.profile.execution_rule,
            self.profile.has_api_credentials(),
            operation,
            api,
            ssh,
        ))
    }

    async fn cli_ok(&self, command: &str) -> Result<CommandOutput> {
        let out = self.ssh.execute(command).await?;
        if !out.success() {
            if out.output.contains("not found") || out.output.contains("doesn't exist") {
                return Err(DriverError::NotFound(out.output));
            }
            if out.output.contains("already exists") {
                return Err(DriverError::AlreadyExists(out.output));
            }
            return Err(DriverError::Transient(format!(
                "{} (exit {})",
                out.output, out.exit_code
            )));
        }
        Ok(out)
    }

    async fn ssh_state(&self, name: &str, verb: &str) -> Result<()> {
        let force = if verb == "stop" { " --force" } else { "" };
        self.cli_ok(&format!("{} {} {}{}", self.cli, verb, name, force))
            .await?;
        Ok(())
    }

    fn discovered_from_value(value: &Value) -> Option<DiscoveredInstance> {
        let name = value.get("name")?.as_str()?.to_string();
        let kind = match value.get("type").and_then(Value::as_str) {
            Some("virtual-machine") => InstanceKind::Vm,
            _ => InstanceKind::Container,
        };
        let config = value.get("config").cloned().unwrap_or(Value::Null);
        let empty = serde_json::Map::new();
        let network = value
            .pointer("/state/network")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut private_ip = None;
        let mut ipv6 = None;
        for (interface, detail) in network {
            if interface == "lo" {
                continue;
            }
            if let Some(addresses) = detail.get("addresses").and_then(Value::as_array) {
                for address in addresses {
                    match address.get("family").and_then(Value::as_str) {
                        Some("inet") if private_ip.is_none() => {
                            private_ip = address
                                .get("address")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                        }
                        Some("inet6") if ipv6.is_none() => {
                            if let Some(addr) = address.get("address").and_then(Value::as_str) {
                                if !addr.starts_with("fe80") {
                                    ipv6 = Some(addr.to_string());
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Some(DiscoveredInstance {
            uuid: config
                .get("volatile.uuid")
                .and_then(Value::as_str)
                .unwrap_or(&name)
                .to_string(),
            name,
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_lowercase(),
            kind,
            cpu_cores: config
                .get("limits.cpu")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            memory_mb: config
                .get("limits.memory")
                .and_then(Value::as_str)
                .map(parse_memory_mb)
                .unwrap_or(0),
            disk_mb: value
                .pointer("/devices/root/size")
                .and_then(Value::as_str)
                .map(parse_memory_mb)
                .unwrap_or(0),
            private_ip,
            public_ip: None,
            ipv6,
            ssh_port: None,
            mac: config
                .get("volatile.eth0.hwaddr")
                .and_then(Value::as_str)
                .map(str::to_string),
            image: config
                .get("image.description")
                .and_then(Value::as_str)
                .map(str::to_string),
            os: config
                .get("image.os")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: value.clone(),
        })
    }
}

/// "2048MB" → 2048, "2GiB" → 2048, "10GB" → 10240
fn parse_memory_mb(text: &str) -> u64 {
    let trimmed = text.trim();
    let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits.parse().unwrap_or(0);
    match unit.trim() {
        "GiB" | "GB" | "G" => value * 1024,
        "TiB" | "TB" | "T" => value * 1024 * 1024,
        "KiB" | "KB" | "K" => value / 1024,
        "B" => value / (1024 * 1024),
        _ => value,
    }
}

#[async_trait]
impl BackendDriver for LinuxContainerDriver {
    fn kind(&self) -> BackendKind {
        self.profile.kind
    }

    fn supported_instance_kinds(&self) -> &'static [InstanceKind] {
        &[InstanceKind::Vm, InstanceKind::Container]
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>> {
        self.discover().await
    }

    async fn get_instance(&self, name: &str) -> Result<DiscoveredInstance> {
        self.dual(
            "get-instance",
            || {
                Box::pin(async move {
                    let value = self.api()?.get_instance(name).await?;
                    Self::discovered_from_value(&value)
                        .ok_or_else(|| DriverError::Transient("unparseable instance".into()))
                })
            },
            || {
                Box::pin(async move {
                    let out = self
                        .cli_ok(&format!("{} list {} --format json", self.cli, name))
                        .await?;
                    let values: Vec<Value> = serde_json::from_str(&out.output)
                        .map_err(|e| DriverError::Transient(format!("bad list json: {}", e)))?;
                    values
                        .iter()
                        .filter_map(Self::discovered_from_value)
                        .find(|guest| guest.name == name)
                        .ok_or_else(|| DriverError::NotFound(format!("instance {}", name)))
                })
            },
        )
        .await
    }

    async fn create_instance(&self, request: &CreateRequest) -> Result<CreatedInstance> {
        validate_create(request, self.supported_instance_kinds())?;
        let alias = self.ensure_image(&request.image).await?;
        let spec = &request.spec;
        info!(name = %spec.name, alias = %alias, "creating {} instance", self.cli);

        self.dual(
            "create-instance",
            || {
                Box::pin(async {
                    let body = json!({
                        "name": spec.name.clone(),
                        "type": match spec.kind {
                            InstanceKind::Vm => "virtual-machine",
                            InstanceKind::Container => "container",
                        },
                        "source": {"type": "image", "alias": alias.clone()},
                        "config": {
                            "limits.cpu": spec.resources.cpu_cores.to_string(),
                            "limits.memory": spec.memory_arg(),
                        },
                        "devices": {
                            "root": {
                                "type": "disk",
                                "path": "/",
                                "pool": "default",
                                "size": format!("{}GiB", spec.disk_gib()),
                            }
                        }
                    });
                    self.api()?.create_instance(body).await?;
                    self.api()?.update_state(&spec.name, "start", false).await?;
                    Ok(())
                })
            },
            || {
                Box::pin(async {
                    let vm_flag = match spec.kind {
                        InstanceKind::Vm => " --vm",
                        InstanceKind::Container => "",
                    };
                    self.cli_ok(&format!(
                        "{cli} launch {alias} {name}{vm} -c limits.cpu={cores} -c limits.memory={mem} \
                         -d root,size={disk}GiB",
                        cli = self.cli,
                        alias = alias,
                        name = spec.name,
                        vm = vm_flag,
                        cores = spec.resources.cpu_cores,
                        mem = spec.memory_arg(),
                        disk = spec.disk_gib(),
                    ))
                    .await?;
                    Ok(())
                })
            },
        )
        .await?;

        // The guest address settles asynchronously; report what is known now
        let created = self.get_instance(&spec.name).await.ok();
        Ok(CreatedInstance {
            private_ip: created.as_ref().and_then(|g| g.private_ip.clone()),
            ipv6: created.as_ref().and_then(|g| g.ipv6.clone()),
            mac: created.as_ref().and_then(|g| g.mac.clone()),
            vmid: None,
        })
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "start-instance",
            || Box::pin(async move { self.api()?.update_state(name, "start", false).await.map(|_| ()) }),
            || Box::pin(self.ssh_state(name, "start")),
        )
        .await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "stop-instance",
            || Box::pin(async move { self.api()?.update_state(name, "stop", true).await.map(|_| ()) }),
            || Box::pin(self.ssh_state(name, "stop")),
        )
        .await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "restart-instance",
            || Box::pin(async move { self.api()?.update_state(name, "restart", true).await.map(|_| ()) }),
            || Box::pin(self.ssh_state(name, "restart")),
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "delete-instance",
            || {
                Box::pin(async move {
                    let _ = self.api()?.update_state(name, "stop", true).await;
                    self.api()?.delete_instance(name).await.map(|_| ())
                })
            },
            || {
                Box::pin(async move {
                    self.cli_ok(&format!("{} delete {} --force", self.cli, name))
                        .await?;
                    Ok(())
                })
            },
        )
        .await
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.dual(
            "list-images",
            || {
                Box::pin(async {
                    let images = self.api()?.list_images().await?;
                    Ok(images
                        .iter()
                        .map(|image| ImageInfo {
                            reference: image
                                .pointer("/aliases/0/name")
                                .and_then(Value::as_str)
                                .or_else(|| image.get("fingerprint").and_then(Value::as_str))
                                .unwrap_or_default()
                                .to_string(),
                            size_bytes: image.get("size").and_then(Value::as_u64),
                            architecture: image
                                .get("architecture")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                        .collect())
                })
            },
            || {
                Box::pin(async {
                    let out = self
                        .cli_ok(&format!("{} image list --format json", self.cli))
                        .await?;
                    let values: Vec<Value> = serde_json::from_str(&out.output)
                        .map_err(|e| DriverError::Transient(format!("bad image json: {}", e)))?;
                    Ok(values
                        .iter()
                        .map(|image| ImageInfo {
                            reference: image
                                .pointer("/aliases/0/name")
                                .and_then(Value::as_str)
                                .or_else(|| image.get("fingerprint").and_then(Value::as_str))
                                .unwrap_or_default()
                                .to_string(),
                            size_bytes: image.get("size").and_then(Value::as_u64),
                            architecture: image
                                .get("architecture")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                        .collect())
                })
            },
        )
        .await
    }

    async fn ensure_image(&self, image: &ImageSource) -> Result<String> {
        self.store
            .ensure(&self.ssh, image, &self.profile.cdn_endpoints)
            .await
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        self.store.delete(&self.ssh, reference).await
    }

    async fn set_password(&self, name: &str, username: &str, password: &str) -> Result<()> {
        self.cli_ok(&format!(
            "{} exec {} -- bash -c \"echo '{}:{}' | chpasswd\"",
            self.cli, name, username, password
        ))
        .await?;
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.ssh.execute(command).await?)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredInstance>> {
        self.dual(
            "discover",
            || {
                Box::pin(async {
                    let values = self.api()?.instances_recursion2().await?;
                    Ok(values
                        .iter()
                        .filter_map(Self::discovered_from_value)
                        .collect())
                })
            },
            || {
                Box::pin(async {
                    let out = self
                        .cli_ok(&format!("{} list --format json", self.cli))
                        .await?;
                    let values: Vec<Value> = serde_json::from_str(&out.output)
                        .map_err(|e| DriverError::Transient(format!("bad list json: {}", e)))?;
                    Ok(values
                        .iter()
                        .filter_map(Self::discovered_from_value)
                        .collect())
                })
            },
        )
        .await
    }

    async fn health(&self) -> HealthResult {
        HealthChecker::new(self.profile.kind)
            .with_borrowed_ssh(self.ssh.clone())
            .with_api(format!("{}/1.0", self.profile.api_base()), true)
            .check()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_parsing() {
        assert_eq!(parse_memory_mb("2048MB"), 2048);
        assert_eq!(parse_memory_mb("2GiB"), 2048);
        assert_eq!(parse_memory_mb("10GB"), 10240);
        assert_eq!(parse_memory_mb("512"), 512);
    }

    #[test]
    fn instance_value_maps() {
        let value = json!({
            "name": "demo",
            "type": "container",
            "status": "Running",
            "config": {
                "limits.cpu": "2",
                "limits.memory": "2048MB",
                "volatile.uuid": "8a6f9c2e-1111-2222-3333-444455556666",
                "volatile.eth0.hwaddr": "00:16:3e:aa:bb:cc",
                "image.os": "Debian"
            },
            "devices": {"root": {"type": "disk", "path": "/", "size": "10GiB"}},
            "state": {
                "network": {
                    "eth0": {
                        "addresses": [
                            {"family": "inet", "address": "10.140.2.5"},
                            {"family": "inet6", "address": "fe80::1"},
                            {"family": "inet6", "address": "2a01:4f8::5"}
                        ]
                    },
                    "lo": {"addresses": [{"family": "inet", "address": "127.0.0.1"}]}
                }
            }
        });
        let guest = LinuxContainerDriver::discovered_from_value(&value).unwrap();
        assert_eq!(guest.name, "demo");
        assert_eq!(guest.status, "running");
        assert_eq!(guest.cpu_cores, 2);
        assert_eq!(guest.memory_mb, 2048);
        assert_eq!(guest.disk_mb, 10240);
        assert_eq!(guest.private_ip.as_deref(), Some("10.140.2.5"));
        assert_eq!(guest.ipv6.as_deref(), Some("2a01:4f8::5"));
        assert_eq!(guest.mac.as_deref(), Some("00:16:3e:aa:bb:cc"));
        assert_eq!(guest.uuid, "8a6f9c2e-1111-2222-3333-444455556666");
    }
}
