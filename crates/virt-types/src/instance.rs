//! Instance classification, resource vectors and discovery payloads

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// VM or container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Vm,
    Container,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Vm => "vm",
            InstanceKind::Container => "container",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(InstanceKind::Vm),
            "container" | "ct" => Ok(InstanceKind::Container),
            other => Err(CommonError::Validation(format!(
                "unknown instance kind: {}",
                other
            ))),
        }
    }
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Resetting,
    Deleting,
    Failed,
    Frozen,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Resetting => "resetting",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Frozen => "frozen",
        }
    }

    /// Resources for these states are reserved but not yet confirmed
    pub fn is_pending_quota(&self) -> bool {
        matches!(self, InstanceStatus::Pending | InstanceStatus::Creating)
    }
}

impl FromStr for InstanceStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "creating" => Ok(InstanceStatus::Creating),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "resetting" => Ok(InstanceStatus::Resetting),
            "deleting" => Ok(InstanceStatus::Deleting),
            "failed" => Ok(InstanceStatus::Failed),
            "frozen" => Ok(InstanceStatus::Frozen),
            other => Err(CommonError::Validation(format!(
                "unknown instance status: {}",
                other
            ))),
        }
    }
}

/// The four accounted resource dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub bandwidth_mbps: u32,
}

impl ResourceVector {
    pub fn new(cpu_cores: u32, memory_mb: u64, disk_mb: u64, bandwidth_mbps: u32) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb,
            bandwidth_mbps,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0 && self.memory_mb == 0 && self.disk_mb == 0 && self.bandwidth_mbps == 0
    }
}

/// What the caller asked the driver to build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub kind: InstanceKind,
    pub resources: ResourceVector,
    pub image: String,
    pub image_url: Option<String>,
    pub os: String,
}

/// One guest found on a backend by the discovery path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredInstance {
    pub uuid: String,
    pub name: String,
    pub status: String,
    pub kind: InstanceKind,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub ipv6: Option<String>,
    pub ssh_port: Option<u16>,
    pub mac: Option<String>,
    pub image: Option<String>,
    pub os: Option<String>,
    /// Raw backend payload, retained for import diagnostics
    pub raw: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_quota_states() {
        assert!(InstanceStatus::Pending.is_pending_quota());
        assert!(InstanceStatus::Creating.is_pending_quota());
        assert!(!InstanceStatus::Running.is_pending_quota());
        assert!(!InstanceStatus::Failed.is_pending_quota());
    }

    #[test]
    fn ct_alias_parses_as_container() {
        assert_eq!("ct".parse::<InstanceKind>().unwrap(), InstanceKind::Container);
    }
}
