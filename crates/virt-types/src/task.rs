//! Task vocabulary and the JSON payload documents keyed by task type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;
use crate::instance::InstanceSpec;
use crate::network::{PortMappingMethod, PortRequest, PortType, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CreateInstance,
    DeleteInstance,
    ResetInstance,
    CreatePortMapping,
    DeletePortMapping,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CreateInstance => "create-instance",
            TaskType::DeleteInstance => "delete-instance",
            TaskType::ResetInstance => "reset-instance",
            TaskType::CreatePortMapping => "create-port-mapping",
            TaskType::DeletePortMapping => "delete-port-mapping",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-instance" => Ok(TaskType::CreateInstance),
            "delete-instance" => Ok(TaskType::DeleteInstance),
            "reset-instance" => Ok(TaskType::ResetInstance),
            "create-port-mapping" => Ok(TaskType::CreatePortMapping),
            "delete-port-mapping" => Ok(TaskType::DeletePortMapping),
            other => Err(CommonError::Validation(format!(
                "unknown task type: {}",
                other
            ))),
        }
    }
}

/// pending → running → {completed | failed | cancelled}; terminal states
/// never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl FromStr for TaskStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(CommonError::Validation(format!(
                "unknown task status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstancePayload {
    pub user_id: i64,
    pub provider_id: i64,
    pub system_image_id: i64,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub ports: Vec<PortRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInstancePayload {
    pub instance_id: i64,
    #[serde(default)]
    pub admin_operation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetInstancePayload {
    pub instance_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMappingPayload {
    pub instance_id: i64,
    pub provider_id: i64,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub is_ssh: bool,
    #[serde(default)]
    pub is_automatic: bool,
    pub port_type: PortType,
    pub mapping_method: PortMappingMethod,
    #[serde(default)]
    pub ipv6_enabled: bool,
}

/// Payload for removing an existing mapping row by id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePortMappingPayload {
    pub mapping_id: i64,
    pub instance_id: i64,
    pub provider_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_kebab_round_trip() {
        for t in [
            TaskType::CreateInstance,
            TaskType::DeleteInstance,
            TaskType::ResetInstance,
            TaskType::CreatePortMapping,
            TaskType::DeletePortMapping,
        ] {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = PortMappingPayload {
            instance_id: 3,
            provider_id: 1,
            host_port: 20022,
            guest_port: 22,
            protocol: Protocol::Tcp,
            is_ssh: true,
            is_automatic: true,
            port_type: PortType::Ssh,
            mapping_method: PortMappingMethod::Iptables,
            ipv6_enabled: false,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: PortMappingPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host_port, 20022);
        assert!(back.is_ssh);
    }
}
