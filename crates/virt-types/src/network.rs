//! Port mapping vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }

    /// `both` expands to one rule per concrete protocol
    pub fn expand(&self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }

    /// Two mappings collide when either side carries the other's protocol
    pub fn overlaps(&self, other: Protocol) -> bool {
        matches!(self, Protocol::Both)
            || matches!(other, Protocol::Both)
            || *self == other
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(CommonError::Validation(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }
}

/// How a host→guest route is realised on the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMappingMethod {
    Iptables,
    DeviceProxy,
    /// Externally managed: recorded, never applied remotely
    Native,
}

impl PortMappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortMappingMethod::Iptables => "iptables",
            PortMappingMethod::DeviceProxy => "device_proxy",
            PortMappingMethod::Native => "native",
        }
    }
}

impl FromStr for PortMappingMethod {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iptables" => Ok(PortMappingMethod::Iptables),
            "device_proxy" => Ok(PortMappingMethod::DeviceProxy),
            "native" => Ok(PortMappingMethod::Native),
            other => Err(CommonError::Validation(format!(
                "unknown mapping method: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Ssh,
    Manual,
    Range,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Ssh => "ssh",
            PortType::Manual => "manual",
            PortType::Range => "range",
        }
    }
}

impl FromStr for PortType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(PortType::Ssh),
            "manual" => Ok(PortType::Manual),
            "range" => Ok(PortType::Range),
            other => Err(CommonError::Validation(format!(
                "unknown port type: {}",
                other
            ))),
        }
    }
}

/// Mapping rows are written `pending` and flip `active` only after the
/// remote apply confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Pending,
    Active,
    Failed,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Active => "active",
            MappingStatus::Failed => "failed",
        }
    }
}

impl FromStr for MappingStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MappingStatus::Pending),
            "active" => Ok(MappingStatus::Active),
            "failed" => Ok(MappingStatus::Failed),
            other => Err(CommonError::Validation(format!(
                "unknown mapping status: {}",
                other
            ))),
        }
    }
}

/// A port the instance spec asks for, before allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRequest {
    pub guest_port: u16,
    pub protocol: Protocol,
    pub is_ssh: bool,
    pub port_type: PortType,
}

impl PortRequest {
    pub fn ssh() -> Self {
        Self {
            guest_port: 22,
            protocol: Protocol::Tcp,
            is_ssh: true,
            port_type: PortType::Ssh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_expands_to_tcp_and_udp() {
        assert_eq!(Protocol::Both.expand(), &["tcp", "udp"]);
        assert_eq!(Protocol::Tcp.expand(), &["tcp"]);
    }

    #[test]
    fn protocol_overlap() {
        assert!(Protocol::Both.overlaps(Protocol::Tcp));
        assert!(Protocol::Udp.overlaps(Protocol::Both));
        assert!(Protocol::Tcp.overlaps(Protocol::Tcp));
        assert!(!Protocol::Tcp.overlaps(Protocol::Udp));
    }
}
