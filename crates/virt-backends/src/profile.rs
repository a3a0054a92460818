//! Connection profile a driver is constructed with

use virt_types::{BackendKind, ExecutionRule, NetworkType};

/// Everything a driver needs to know about its backend, decoupled from the
/// persistence layer.
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub id: i64,
    pub name: String,
    pub kind: BackendKind,
    pub architecture: String,
    pub host: String,
    pub api_port: u16,
    pub execution_rule: ExecutionRule,
    pub network_type: NetworkType,
    /// Proxmox API token: `<token-id>=<secret>`
    pub api_token: Option<String>,
    /// LXD/Incus client certificate PEM
    pub api_cert: Option<String>,
    pub api_cert_key: Option<String>,
    pub insecure_tls: bool,
    /// Proxmox cluster node name, used in API paths
    pub node: String,
    pub public_ip: Option<String>,
    /// CDN endpoints probed before image downloads; empty disables prefixing
    pub cdn_endpoints: Vec<String>,
}

impl BackendProfile {
    pub fn has_api_credentials(&self) -> bool {
        match self.kind {
            BackendKind::Proxmox => self.api_token.is_some(),
            BackendKind::Lxd | BackendKind::Incus => {
                self.api_cert.is_some() && self.api_cert_key.is_some()
            }
            // The Docker engine API needs no credential on 2375
            BackendKind::Docker => true,
        }
    }

    pub fn api_base(&self) -> String {
        match self.kind {
            BackendKind::Proxmox => format!("https://{}:{}/api2/json", self.host, self.api_port),
            BackendKind::Lxd | BackendKind::Incus => {
                format!("https://{}:{}", self.host, self.api_port)
            }
            BackendKind::Docker => format!("http://{}:{}", self.host, self.api_port),
        }
    }
}
