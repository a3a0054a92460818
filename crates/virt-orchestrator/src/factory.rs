//! Driver construction per backend kind

use std::sync::Arc;

use async_trait::async_trait;

use virt_backends::{
    BackendDriver, BackendProfile, DockerDriver, LinuxContainerDriver, ProxmoxDriver,
};
use virt_db::BackendRow;
use virt_ssh::SshClient;
use virt_tasks::{DriverProvider, TaskError};
use virt_types::BackendKind;

use crate::connections::ConnectionManager;

pub fn profile_from_row(
    backend: &BackendRow,
    cdn_endpoints: &[String],
) -> Result<BackendProfile, TaskError> {
    let kind = backend.kind()?;
    Ok(BackendProfile {
        id: backend.id,
        name: backend.name.clone(),
        kind,
        architecture: backend.architecture.clone(),
        host: backend.host.clone(),
        api_port: kind.default_api_port(),
        execution_rule: backend.execution_rule()?,
        network_type: backend.network_type()?,
        api_token: backend.api_token.clone(),
        api_cert: backend.api_cert.clone(),
        api_cert_key: backend.api_cert_key.clone(),
        // Self-signed certificates are the norm on these backends
        insecure_tls: true,
        // Convention: the backend's registered name is its PVE node name
        node: backend.name.clone(),
        public_ip: backend.public_ip.clone(),
        cdn_endpoints: cdn_endpoints.to_vec(),
    })
}

pub struct DriverFactory {
    connections: Arc<ConnectionManager>,
    cdn_endpoints: Vec<String>,
}

impl DriverFactory {
    pub fn new(connections: Arc<ConnectionManager>, cdn_endpoints: Vec<String>) -> Self {
        Self {
            connections,
            cdn_endpoints,
        }
    }
}

#[async_trait]
impl DriverProvider for DriverFactory {
    async fn driver(&self, backend: &BackendRow) -> virt_tasks::Result<Arc<dyn BackendDriver>> {
        let ssh = self.connections.client_for(backend).await?;
        let profile = profile_from_row(backend, &self.cdn_endpoints)?;
        let driver: Arc<dyn BackendDriver> = match profile.kind {
            BackendKind::Proxmox => Arc::new(ProxmoxDriver::new(profile, ssh)?),
            BackendKind::Lxd | BackendKind::Incus => {
                Arc::new(LinuxContainerDriver::new(profile, ssh)?)
            }
            BackendKind::Docker => Arc::new(DockerDriver::new(profile, ssh)?),
        };
        Ok(driver)
    }

    async fn ssh(&self, backend: &BackendRow) -> virt_tasks::Result<Arc<SshClient>> {
        Ok(self.connections.client_for(backend).await?)
    }
}
