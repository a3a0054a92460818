//! The uniform capability surface the task engine programs against

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use virt_health::HealthResult;
use virt_ssh::CommandOutput;
use virt_types::{BackendKind, DiscoveredInstance, InstanceKind, InstanceSpec, Protocol};

use crate::error::Result;

/// Image selected from the system-image catalog for a create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    pub name: String,
    pub url: String,
    pub architecture: String,
    pub instance_kind: InstanceKind,
    pub os: String,
}

/// Port published at container create time (Docker sets these once)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedPort {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub spec: InstanceSpec,
    pub image: ImageSource,
    pub password: Option<String>,
    /// Only honoured by backends that bind ports at create time
    pub publish_ports: Vec<PublishedPort>,
    pub configure_ipv6: bool,
}

/// What the driver learned about the guest it created
#[derive(Debug, Clone, Default)]
pub struct CreatedInstance {
    pub private_ip: Option<String>,
    pub ipv6: Option<String>,
    pub mac: Option<String>,
    /// Proxmox guest identifier
    pub vmid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub reference: String,
    pub size_bytes: Option<u64>,
    pub architecture: Option<String>,
}

/// Capability set every backend implements. Mutating methods follow the
/// dual-path rule in [`crate::policy`].
#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn supported_instance_kinds(&self) -> &'static [InstanceKind];

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>>;

    async fn get_instance(&self, name: &str) -> Result<DiscoveredInstance>;

    async fn create_instance(&self, request: &CreateRequest) -> Result<CreatedInstance>;

    async fn start_instance(&self, name: &str) -> Result<()>;

    async fn stop_instance(&self, name: &str) -> Result<()>;

    async fn restart_instance(&self, name: &str) -> Result<()>;

    async fn delete_instance(&self, name: &str) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Make the image available on the remote, returning the reference a
    /// create can use. Downloads happen on the remote host and identical
    /// concurrent downloads deduplicate by hash-derived naming.
    async fn ensure_image(&self, image: &ImageSource) -> Result<String>;

    async fn delete_image(&self, reference: &str) -> Result<()>;

    async fn set_password(&self, name: &str, username: &str, password: &str) -> Result<()>;

    /// Raw command on the backend host
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Enumerate every guest present on the backend, managed or not
    async fn discover(&self) -> Result<Vec<DiscoveredInstance>>;

    async fn health(&self) -> HealthResult;

    /// Resolve a guest's private address, when the backend knows it
    async fn instance_ip(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get_instance(name).await?.private_ip)
    }
}

/// Spec-level validation shared by drivers before any remote work
pub fn validate_create(request: &CreateRequest, supported: &[InstanceKind]) -> Result<()> {
    if !supported.contains(&request.spec.kind) {
        return Err(crate::error::DriverError::Validation(format!(
            "instance kind {} not supported by this backend",
            request.spec.kind.as_str()
        )));
    }
    if request.spec.resources.cpu_cores == 0 || request.spec.resources.memory_mb == 0 {
        return Err(crate::error::DriverError::Validation(
            "instance spec must request at least one core and some memory".to_string(),
        ));
    }
    Ok(())
}

/// Backend-facing helpers derived from the spec
pub trait InstanceSpecExt {
    fn memory_arg(&self) -> String;
    fn disk_gib(&self) -> u64;
}

impl InstanceSpecExt for InstanceSpec {
    fn memory_arg(&self) -> String {
        format!("{}MB", self.resources.memory_mb)
    }

    /// Disk sizes round up to whole GiB for backends that only take GiB
    fn disk_gib(&self) -> u64 {
        self.resources.disk_mb.div_ceil(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virt_types::ResourceVector;

    fn request(kind: InstanceKind) -> CreateRequest {
        CreateRequest {
            spec: InstanceSpec {
                name: "demo".into(),
                kind,
                resources: ResourceVector::new(2, 2048, 10240, 100),
                image: "debian-12-amd64".into(),
                image_url: None,
                os: "debian".into(),
            },
            image: ImageSource {
                name: "debian-12-amd64".into(),
                url: "https://images.example.com/debian-12-amd64.tar.xz".into(),
                architecture: "amd64".into(),
                instance_kind: kind,
                os: "debian".into(),
            },
            password: None,
            publish_ports: vec![],
            configure_ipv6: false,
        }
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        let err = validate_create(&request(InstanceKind::Vm), &[InstanceKind::Container])
            .unwrap_err();
        assert!(matches!(err, crate::error::DriverError::Validation(_)));
    }

    #[test]
    fn zero_resources_are_rejected() {
        let mut req = request(InstanceKind::Container);
        req.spec.resources.cpu_cores = 0;
        assert!(validate_create(&req, &[InstanceKind::Container]).is_err());
    }

    #[test]
    fn disk_rounds_up_to_gib() {
        let req = request(InstanceKind::Container);
        assert_eq!(req.spec.disk_gib(), 10);
        let mut odd = request(InstanceKind::Container);
        odd.spec.resources.disk_mb = 10241;
        assert_eq!(odd.spec.disk_gib(), 11);
    }
}
