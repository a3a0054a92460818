//! Proxmox VE API client
//!
//! Token auth (`Authorization: PVEAPIToken=<id>=<secret>`), JSON envelope
//! under `/api2/json`, HTTPS on 8006 with optional insecure TLS.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::profile::BackendProfile;

const API_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxmoxApi {
    base: String,
    token: String,
    node: String,
    client: reqwest::Client,
}

impl ProxmoxApi {
    pub fn new(profile: &BackendProfile) -> Result<Self> {
        let raw = profile.api_token.as_deref().ok_or_else(|| {
            DriverError::Validation("proxmox API requested without a token".to_string())
        })?;
        // Tokens pasted from the UI occasionally carry line endings
        let token: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(profile.insecure_tls)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Fatal(format!("http client build failed: {}", e)))?;

        Ok(Self {
            base: profile.api_base(),
            token,
            node: profile.node.clone(),
            client,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn auth_value(&self) -> String {
        format!("PVEAPIToken={}", self.token)
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                let body: Value = response.json().await?;
                Ok(body.get("data").cloned().unwrap_or(Value::Null))
            }
            401 | 403 => Err(DriverError::Unauthorized(format!("HTTP {}", status))),
            404 => Err(DriverError::NotFound(format!("HTTP {}", status))),
            500..=599 => Err(DriverError::Transient(format!("HTTP {}", status))),
            _ => Err(DriverError::Transient(format!("HTTP {}", status))),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        debug!(path, "pve api get");
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .header("Authorization", self.auth_value())
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn post(&self, path: &str, form: &[(&str, String)]) -> Result<Value> {
        debug!(path, "pve api post");
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .header("Authorization", self.auth_value())
            .form(form)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        debug!(path, "pve api delete");
        let response = self
            .client
            .delete(format!("{}{}", self.base, path))
            .header("Authorization", self.auth_value())
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn version(&self) -> Result<Value> {
        self.get("/version").await
    }

    /// Cluster-wide guest listing used by discovery
    pub async fn cluster_vms(&self) -> Result<Vec<Value>> {
        let data = self.get("/cluster/resources?type=vm").await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    pub async fn next_vmid(&self) -> Result<u32> {
        let data = self.get("/cluster/nextid").await?;
        match &data {
            Value::String(s) => s
                .parse()
                .map_err(|_| DriverError::Transient(format!("bad nextid: {}", s))),
            Value::Number(n) => Ok(n.as_u64().unwrap_or_default() as u32),
            other => Err(DriverError::Transient(format!("bad nextid: {}", other))),
        }
    }

    pub async fn create_guest(
        &self,
        is_vm: bool,
        form: &[(&str, String)],
    ) -> Result<Value> {
        let family = if is_vm { "qemu" } else { "lxc" };
        self.post(&format!("/nodes/{}/{}", self.node, family), form)
            .await
    }

    pub async fn guest_status(&self, is_vm: bool, vmid: u32) -> Result<Value> {
        let family = if is_vm { "qemu" } else { "lxc" };
        self.get(&format!(
            "/nodes/{}/{}/{}/status/current",
            self.node, family, vmid
        ))
        .await
    }

    pub async fn guest_action(&self, is_vm: bool, vmid: u32, action: &str) -> Result<Value> {
        let family = if is_vm { "qemu" } else { "lxc" };
        self.post(
            &format!("/nodes/{}/{}/{}/status/{}", self.node, family, vmid, action),
            &[],
        )
        .await
    }

    pub async fn delete_guest(&self, is_vm: bool, vmid: u32) -> Result<Value> {
        let family = if is_vm { "qemu" } else { "lxc" };
        self.delete(&format!(
            "/nodes/{}/{}/{}?purge=1&destroy-unreferenced-disks=1",
            self.node, family, vmid
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virt_types::{BackendKind, ExecutionRule, NetworkType};

    fn profile(token: &str) -> BackendProfile {
        BackendProfile {
            id: 1,
            name: "pve1".into(),
            kind: BackendKind::Proxmox,
            architecture: "amd64".into(),
            host: "10.0.0.2".into(),
            api_port: 8006,
            execution_rule: ExecutionRule::Auto,
            network_type: NetworkType::NatIpv4,
            api_token: Some(token.into()),
            api_cert: None,
            api_cert_key: None,
            insecure_tls: true,
            node: "pve".into(),
            public_ip: None,
            cdn_endpoints: vec![],
        }
    }

    #[test]
    fn token_is_stripped_of_line_endings() {
        let api = ProxmoxApi::new(&profile("root@pam!orch=abc\r\n")).unwrap();
        assert_eq!(api.auth_value(), "PVEAPIToken=root@pam!orch=abc");
    }

    #[test]
    fn missing_token_is_validation_error() {
        let mut p = profile("x");
        p.api_token = None;
        assert!(matches!(
            ProxmoxApi::new(&p).unwrap_err(),
            DriverError::Validation(_)
        ));
    }
}
