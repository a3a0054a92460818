//! Docker driver
//!
//! Ports are published once at container create; a runtime port change means
//! a recreate, which this driver refuses with a typed error. The API path
//! rides bollard over the engine's HTTP socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::info;

use virt_health::{HealthChecker, HealthResult};
use virt_ssh::{CommandOutput, SshClient};
use virt_types::{BackendKind, DiscoveredInstance, InstanceKind};

use crate::driver::{
    validate_create, BackendDriver, CreateRequest, CreatedInstance, ImageInfo, ImageSource,
    PublishedPort,
};
use crate::error::{DriverError, Result};
use crate::policy::run_dual;
use crate::profile::BackendProfile;

const API_TIMEOUT_SECS: u64 = 30;

pub struct DockerDriver {
    profile: BackendProfile,
    ssh: Arc<SshClient>,
    api: Option<Docker>,
}

impl DockerDriver {
    pub fn new(profile: BackendProfile, ssh: Arc<SshClient>) -> Result<Self> {
        let api = Docker::connect_with_http(
            &profile.api_base(),
            API_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .ok();
        Ok(Self { profile, ssh, api })
    }

    fn api(&self) -> Result<&Docker> {
        self.api
            .as_ref()
            .ok_or_else(|| DriverError::NotConnected("docker engine API unavailable".to_string()))
    }

    fn dual<'a, T: Send + 'a>(
        &'a self,
        operation: &'a str,
        api: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
        ssh: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
    ) -> BoxFuture<'a, Result<T>> {
        Box::pin(run_dual(
            self.profile.execution_rule,
            self.profile.has_api_credentials() && self.api.is_some(),
            operation,
            api,
            ssh,
        ))
    }

    /// Runtime port changes are a recreate on Docker and refused here.
    pub fn add_runtime_port(&self) -> Result<()> {
        Err(DriverError::Unsupported(
            "docker publishes ports at container create; changing them requires a recreate"
                .to_string(),
        ))
    }

    fn binding_maps(
        ports: &[PublishedPort],
    ) -> (
        HashMap<String, HashMap<(), ()>>,
        HashMap<String, Option<Vec<PortBinding>>>,
    ) {
        let mut exposed = HashMap::new();
        let mut bindings = HashMap::new();
        for port in ports {
            for proto in port.protocol.expand() {
                let key = format!("{}/{}", port.guest_port, proto);
                exposed.insert(key.clone(), HashMap::new());
                bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.host_port.to_string()),
                    }]),
                );
            }
        }
        (exposed, bindings)
    }

    /// `host-ip:host-port:guest-port/proto` publish arguments for the CLI path
    fn publish_args(ports: &[PublishedPort]) -> String {
        let mut args = String::new();
        for port in ports {
            for proto in port.protocol.expand() {
                args.push_str(&format!(
                    " -p 0.0.0.0:{}:{}/{}",
                    port.host_port, port.guest_port, proto
                ));
            }
        }
        args
    }

    async fn api_create(&self, request: &CreateRequest) -> Result<()> {
        let api = self.api()?;
        let spec = &request.spec;

        // Make sure the image exists locally before the create references it
        let mut pull = api.create_image(
            Some(CreateImageOptions {
                from_image: request.image.name.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }

        let (exposed, bindings) = Self::binding_maps(&request.publish_ports);
        let host_config = HostConfig {
            port_bindings: Some(bindings),
            memory: Some((spec.resources.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some(spec.resources.cpu_cores as i64 * 1_000_000_000),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let config = Config {
            image: Some(request.image.name.clone()),
            hostname: Some(spec.name.clone()),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };

        api.create_container(
            Some(CreateContainerOptions {
                name: spec.name.clone(),
                platform: None,
            }),
            config,
        )
        .await?;
        api.start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn ssh_create(&self, request: &CreateRequest) -> Result<()> {
        let spec = &request.spec;
        let command = format!(
            "docker run -d --name {name} --hostname {name} --memory {mem}m --cpus {cores} \
             --restart unless-stopped{ports} {image}",
            name = spec.name,
            mem = spec.resources.memory_mb,
            cores = spec.resources.cpu_cores,
            ports = Self::publish_args(&request.publish_ports),
            image = request.image.name,
        );
        let out = self.ssh.execute(&command).await?;
        if !out.success() {
            if out.output.contains("is already in use") {
                return Err(DriverError::AlreadyExists(spec.name.clone()));
            }
            return Err(DriverError::Transient(format!(
                "docker run failed: {}",
                out.output
            )));
        }
        Ok(())
    }

    fn discovered_from_inspect(value: &Value) -> Option<DiscoveredInstance> {
        let name = value
            .get("Name")?
            .as_str()?
            .trim_start_matches('/')
            .to_string();
        let state = value.pointer("/State/Status").and_then(Value::as_str);
        let network = value.pointer("/NetworkSettings/IPAddress").and_then(Value::as_str);
        let mac = value
            .pointer("/NetworkSettings/MacAddress")
            .and_then(Value::as_str);
        let memory = value
            .pointer("/HostConfig/Memory")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let nano_cpus = value
            .pointer("/HostConfig/NanoCpus")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        Some(DiscoveredInstance {
            uuid: value
                .get("Id")
                .and_then(Value::as_str)
                .unwrap_or(&name)
                .to_string(),
            name,
            status: state.unwrap_or("unknown").to_string(),
            kind: InstanceKind::Container,
            cpu_cores: (nano_cpus / 1_000_000_000) as u32,
            memory_mb: (memory / (1024 * 1024)).max(0) as u64,
            disk_mb: 0,
            private_ip: network.filter(|ip| !ip.is_empty()).map(str::to_string),
            public_ip: None,
            ipv6: value
                .pointer("/NetworkSettings/GlobalIPv6Address")
                .and_then(Value::as_str)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string),
            ssh_port: None,
            mac: mac.filter(|m| !m.is_empty()).map(str::to_string),
            image: value
                .pointer("/Config/Image")
                .and_then(Value::as_str)
                .map(str::to_string),
            os: None,
            raw: value.clone(),
        })
    }
}

#[async_trait]
impl BackendDriver for DockerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn supported_instance_kinds(&self) -> &'static [InstanceKind] {
        &[InstanceKind::Container]
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>> {
        self.discover().await
    }

    async fn get_instance(&self, name: &str) -> Result<DiscoveredInstance> {
        self.dual(
            "get-instance",
            || {
                Box::pin(async move {
                    let inspect = self.api()?.inspect_container(name, None).await?;
                    let value = serde_json::to_value(&inspect)
                        .map_err(|e| DriverError::Transient(e.to_string()))?;
                    Self::discovered_from_inspect(&value)
                        .ok_or_else(|| DriverError::Transient("unparseable inspect".into()))
                })
            },
            || {
                Box::pin(async move {
                    let out = self.ssh.execute(&format!("docker inspect {}", name)).await?;
                    if !out.success() {
                        return Err(DriverError::NotFound(format!("container {}", name)));
                    }
                    let values: Vec<Value> = serde_json::from_str(&out.output)
                        .map_err(|e| DriverError::Transient(format!("bad inspect json: {}", e)))?;
                    values
                        .first()
                        .and_then(Self::discovered_from_inspect)
                        .ok_or_else(|| DriverError::NotFound(format!("container {}", name)))
                })
            },
        )
        .await
    }

    async fn create_instance(&self, request: &CreateRequest) -> Result<CreatedInstance> {
        validate_create(request, self.supported_instance_kinds())?;
        info!(name = %request.spec.name, image = %request.image.name, "creating docker container");

        self.dual(
            "create-instance",
            || Box::pin(self.api_create(request)),
            || Box::pin(self.ssh_create(request)),
        )
        .await?;

        let created = self.get_instance(&request.spec.name).await.ok();
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
            || {
                Box::pin(async move {
                    self.api()?
                        .start_container(name, None::<StartContainerOptions<String>>)
                        .await
                        .map_err(Into::into)
                })
            },
            || {
                Box::pin(async move {
                    let out = self.ssh.execute(&format!("docker start {}", name)).await?;
                    if !out.success() {
                        return Err(DriverError::Transient(out.output));
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "stop-instance",
            || {
                Box::pin(async move {
                    self.api()?
                        .stop_container(name, Some(StopContainerOptions { t: 30 }))
                        .await
                        .map_err(Into::into)
                })
            },
            || {
                Box::pin(async move {
                    let out = self.ssh.execute(&format!("docker stop {}", name)).await?;
                    if !out.success() {
                        return Err(DriverError::Transient(out.output));
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "restart-instance",
            || {
                Box::pin(async move {
                    self.api()?
                        .restart_container(name, Some(RestartContainerOptions { t: 30 }))
                        .await
                        .map_err(Into::into)
                })
            },
            || {
                Box::pin(async move {
                    let out = self.ssh.execute(&format!("docker restart {}", name)).await?;
                    if !out.success() {
                        return Err(DriverError::Transient(out.output));
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.dual(
            "delete-instance",
            || {
                Box::pin(async move {
                    self.api()?
                        .remove_container(
                            name,
                            Some(RemoveContainerOptions {
                                force: true,
                                v: true,
                                ..Default::default()
                            }),
                        )
                        .await
                        .map_err(Into::into)
                })
            },
            || {
                Box::pin(async move {
                    let out = self
                        .ssh
                        .execute(&format!("docker rm -f -v {}", name))
                        .await?;
                    if !out.success() && !out.output.contains("No such container") {
                        return Err(DriverError::Transient(out.output));
                    }
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
                    let images = self
                        .api()?
                        .list_images(Some(ListImagesOptions::<String> {
                            all: false,
                            ..Default::default()
                        }))
                        .await?;
                    Ok(images
                        .into_iter()
                        .map(|image| ImageInfo {
                            reference: image
                                .repo_tags
                                .first()
                                .cloned()
                                .unwrap_or(image.id),
                            size_bytes: Some(image.size as u64),
                            architecture: None,
                        })
                        .collect())
                })
            },
            || {
                Box::pin(async {
                    let out = self
                        .ssh
                        .execute("docker images --format '{{.Repository}}:{{.Tag}} {{.Size}}'")
                        .await?;
                    Ok(out
                        .output
                        .lines()
                        .filter_map(|line| {
                            let reference = line.split_whitespace().next()?;
                            Some(ImageInfo {
                                reference: reference.to_string(),
                                size_bytes: None,
                                architecture: None,
                            })
                        })
                        .collect())
                })
            },
        )
        .await
    }

    async fn ensure_image(&self, image: &ImageSource) -> Result<String> {
        self.dual(
            "ensure-image",
            || {
                Box::pin(async {
                    let mut pull = self.api()?.create_image(
                        Some(CreateImageOptions {
                            from_image: image.name.clone(),
                            ..Default::default()
                        }),
                        None,
                        None,
                    );
                    while let Some(progress) = pull.next().await {
                        progress?;
                    }
                    Ok(image.name.clone())
                })
            },
            || {
                Box::pin(async {
                    let out = self
                        .ssh
                        .execute(&format!("docker pull {}", image.name))
                        .await?;
                    if !out.success() {
                        return Err(DriverError::Transient(format!(
                            "docker pull failed: {}",
                            out.output
                        )));
                    }
                    Ok(image.name.clone())
                })
            },
        )
        .await
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        self.dual(
            "delete-image",
            || {
                Box::pin(async move {
                    self.api()?
                        .remove_image(reference, None::<RemoveImageOptions>, None)
                        .await
                        .map(|_| ())
                        .map_err(Into::into)
                })
            },
            || {
                Box::pin(async move {
                    let out = self.ssh.execute(&format!("docker rmi {}", reference)).await?;
                    if !out.success() {
                        return Err(DriverError::Transient(out.output));
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    async fn set_password(&self, name: &str, username: &str, password: &str) -> Result<()> {
        let out = self
            .ssh
            .execute(&format!(
                "docker exec {} sh -c \"echo '{}:{}' | chpasswd\"",
                name, username, password
            ))
            .await?;
        if !out.success() {
            return Err(DriverError::Transient(format!(
                "password set failed: {}",
                out.output
            )));
        }
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
                    let summaries = self
                        .api()?
                        .list_containers(Some(ListContainersOptions::<String> {
                            all: true,
                            ..Default::default()
                        }))
                        .await?;
                    let mut guests = Vec::with_capacity(summaries.len());
                    for summary in summaries {
                        let Some(id) = summary.id else { continue };
                        let inspect = self.api()?.inspect_container(&id, None).await?;
                        let value = serde_json::to_value(&inspect)
                            .map_err(|e| DriverError::Transient(e.to_string()))?;
                        if let Some(guest) = Self::discovered_from_inspect(&value) {
                            guests.push(guest);
                        }
                    }
                    Ok(guests)
                })
            },
            || {
                Box::pin(async {
                    let out = self
                        .ssh
                        .execute("docker ps -aq | xargs -r docker inspect")
                        .await?;
                    if out.output.trim().is_empty() {
                        return Ok(Vec::new());
                    }
                    let values: Vec<Value> = serde_json::from_str(&out.output)
                        .map_err(|e| DriverError::Transient(format!("bad inspect json: {}", e)))?;
                    Ok(values
                        .iter()
                        .filter_map(Self::discovered_from_inspect)
                        .collect())
                })
            },
        )
        .await
    }

    async fn health(&self) -> HealthResult {
        HealthChecker::new(BackendKind::Docker)
            .with_borrowed_ssh(self.ssh.clone())
            .with_api(format!("{}/_ping", self.profile.api_base()), true)
            .check()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use virt_types::Protocol;

    #[test]
    fn publish_args_expand_both() {
        let ports = vec![PublishedPort {
            host_port: 20022,
            guest_port: 22,
            protocol: Protocol::Both,
        }];
        let args = DockerDriver::publish_args(&ports);
        assert!(args.contains("-p 0.0.0.0:20022:22/tcp"));
        assert!(args.contains("-p 0.0.0.0:20022:22/udp"));
    }

    #[test]
    fn binding_maps_cover_exposed_and_bound() {
        let ports = vec![PublishedPort {
            host_port: 8080,
            guest_port: 80,
            protocol: Protocol::Tcp,
        }];
        let (exposed, bindings) = DockerDriver::binding_maps(&ports);
        assert!(exposed.contains_key("80/tcp"));
        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn inspect_value_maps() {
        let value = json!({
            "Id": "deadbeef",
            "Name": "/demo",
            "State": {"Status": "running"},
            "Config": {"Image": "debian:12"},
            "HostConfig": {"Memory": 2147483648i64, "NanoCpus": 2000000000i64},
            "NetworkSettings": {
                "IPAddress": "172.17.0.3",
                "MacAddress": "02:42:ac:11:00:03",
                "GlobalIPv6Address": ""
            }
        });
        let guest = DockerDriver::discovered_from_inspect(&value).unwrap();
        assert_eq!(guest.name, "demo");
        assert_eq!(guest.cpu_cores, 2);
        assert_eq!(guest.memory_mb, 2048);
        assert_eq!(guest.private_ip.as_deref(), Some("172.17.0.3"));
        assert!(guest.ipv6.is_none());
    }
}
