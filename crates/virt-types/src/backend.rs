//! Backend (provider) classification types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// The kind of remote virtualisation host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Proxmox,
    Lxd,
    Incus,
    Docker,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Proxmox => "proxmox",
            BackendKind::Lxd => "lxd",
            BackendKind::Incus => "incus",
            BackendKind::Docker => "docker",
        }
    }

    /// Default port of the backend's native API
    pub fn default_api_port(&self) -> u16 {
        match self {
            BackendKind::Proxmox => 8006,
            BackendKind::Lxd | BackendKind::Incus => 8443,
            BackendKind::Docker => 2375,
        }
    }

    /// CLI word used on the remote host (`lxc` vs `incus`)
    pub fn cli_name(&self) -> &'static str {
        match self {
            BackendKind::Proxmox => "qm",
            BackendKind::Lxd => "lxc",
            BackendKind::Incus => "incus",
            BackendKind::Docker => "docker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxmox" => Ok(BackendKind::Proxmox),
            "lxd" => Ok(BackendKind::Lxd),
            "incus" => Ok(BackendKind::Incus),
            "docker" => Ok(BackendKind::Docker),
            other => Err(CommonError::Validation(format!(
                "unknown backend kind: {}",
                other
            ))),
        }
    }
}

/// How mutating operations reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRule {
    /// API only; API failure is final
    ApiOnly,
    /// SSH command sequence only
    SshOnly,
    /// API preferred, SSH fallback mandatory on API failure
    Auto,
}

impl ExecutionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionRule::ApiOnly => "api_only",
            ExecutionRule::SshOnly => "ssh_only",
            ExecutionRule::Auto => "auto",
        }
    }
}

impl FromStr for ExecutionRule {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_only" => Ok(ExecutionRule::ApiOnly),
            "ssh_only" => Ok(ExecutionRule::SshOnly),
            "auto" => Ok(ExecutionRule::Auto),
            other => Err(CommonError::Validation(format!(
                "unknown execution rule: {}",
                other
            ))),
        }
    }
}

/// Network mode a backend hands to its instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    NatIpv4,
    DedicatedIpv4,
    NatIpv4Ipv6,
    DedicatedIpv4Ipv6,
    Ipv6Only,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::NatIpv4 => "nat_ipv4",
            NetworkType::DedicatedIpv4 => "dedicated_ipv4",
            NetworkType::NatIpv4Ipv6 => "nat_ipv4_ipv6",
            NetworkType::DedicatedIpv4Ipv6 => "dedicated_ipv4_ipv6",
            NetworkType::Ipv6Only => "ipv6_only",
        }
    }

    /// NAT-based modes require the port-mapping planner
    pub fn is_nat(&self) -> bool {
        matches!(self, NetworkType::NatIpv4 | NetworkType::NatIpv4Ipv6)
    }

    pub fn has_ipv6(&self) -> bool {
        matches!(
            self,
            NetworkType::NatIpv4Ipv6 | NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only
        )
    }

    pub fn is_ipv6_only(&self) -> bool {
        matches!(self, NetworkType::Ipv6Only)
    }
}

impl FromStr for NetworkType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat_ipv4" => Ok(NetworkType::NatIpv4),
            "dedicated_ipv4" => Ok(NetworkType::DedicatedIpv4),
            "nat_ipv4_ipv6" => Ok(NetworkType::NatIpv4Ipv6),
            "dedicated_ipv4_ipv6" => Ok(NetworkType::DedicatedIpv4Ipv6),
            "ipv6_only" => Ok(NetworkType::Ipv6Only),
            other => Err(CommonError::Validation(format!(
                "unknown network type: {}",
                other
            ))),
        }
    }
}

/// Which direction of traffic counts against an instance's allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficCountMode {
    In,
    Out,
    Both,
    Max,
}

impl TrafficCountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficCountMode::In => "in",
            TrafficCountMode::Out => "out",
            TrafficCountMode::Both => "both",
            TrafficCountMode::Max => "max",
        }
    }

    /// Fold rx/tx byte totals into the billable figure for this mode
    pub fn select(&self, rx_bytes: u64, tx_bytes: u64) -> u64 {
        match self {
            TrafficCountMode::In => rx_bytes,
            TrafficCountMode::Out => tx_bytes,
            TrafficCountMode::Both => rx_bytes + tx_bytes,
            TrafficCountMode::Max => rx_bytes.max(tx_bytes),
        }
    }
}

impl FromStr for TrafficCountMode {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(TrafficCountMode::In),
            "out" => Ok(TrafficCountMode::Out),
            "both" => Ok(TrafficCountMode::Both),
            "max" => Ok(TrafficCountMode::Max),
            other => Err(CommonError::Validation(format!(
                "unknown traffic count mode: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trip() {
        for kind in [
            BackendKind::Proxmox,
            BackendKind::Lxd,
            BackendKind::Incus,
            BackendKind::Docker,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn nat_modes_need_planner() {
        assert!(NetworkType::NatIpv4.is_nat());
        assert!(NetworkType::NatIpv4Ipv6.is_nat());
        assert!(!NetworkType::DedicatedIpv4.is_nat());
        assert!(!NetworkType::Ipv6Only.is_nat());
    }

    #[test]
    fn count_mode_selection() {
        assert_eq!(TrafficCountMode::In.select(10, 4), 10);
        assert_eq!(TrafficCountMode::Out.select(10, 4), 4);
        assert_eq!(TrafficCountMode::Both.select(10, 4), 14);
        assert_eq!(TrafficCountMode::Max.select(10, 4), 10);
    }
}
