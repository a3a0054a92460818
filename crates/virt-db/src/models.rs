//! Row types mapped from the schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use virt_types::{
    BackendKind, ExecutionRule, InstanceKind, InstanceStatus, MappingStatus, NetworkType,
    PortMappingMethod, PortType, Protocol, ResourceVector, TaskStatus, TaskType, TrafficCountMode,
};

use crate::error::Result;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BackendRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub region: String,
    pub architecture: String,
    pub host: String,
    pub ssh_port: i32,
    pub ssh_username: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub api_cert: Option<String>,
    pub api_cert_key: Option<String>,
    pub api_token: Option<String>,
    pub execution_rule: String,
    pub allow_concurrent_tasks: bool,
    pub max_concurrent_tasks: i32,
    pub ipv4_mapping_method: String,
    pub ipv6_mapping_method: String,
    pub network_type: String,
    pub traffic_count_mode: String,
    pub traffic_multiplier: f64,
    pub enable_traffic_control: bool,
    pub port_range_start: i32,
    pub port_range_end: i32,
    pub total_cpu_cores: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub used_cpu_cores: u32,
    pub used_memory_mb: u64,
    pub used_disk_mb: u64,
    pub status: String,
    pub is_frozen: bool,
    pub frozen_at: Option<DateTime<Utc>>,
    pub frozen_reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_manual_expiry: bool,
    pub public_ip: Option<String>,
    pub port_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BackendRow {
    pub fn kind(&self) -> Result<BackendKind> {
        Ok(BackendKind::from_str(&self.kind)?)
    }

    pub fn execution_rule(&self) -> Result<ExecutionRule> {
        Ok(ExecutionRule::from_str(&self.execution_rule)?)
    }

    pub fn network_type(&self) -> Result<NetworkType> {
        Ok(NetworkType::from_str(&self.network_type)?)
    }

    pub fn traffic_count_mode(&self) -> Result<TrafficCountMode> {
        Ok(TrafficCountMode::from_str(&self.traffic_count_mode)?)
    }

    pub fn ipv4_mapping_method(&self) -> Result<PortMappingMethod> {
        Ok(PortMappingMethod::from_str(&self.ipv4_mapping_method)?)
    }

    pub fn ipv6_mapping_method(&self) -> Result<PortMappingMethod> {
        Ok(PortMappingMethod::from_str(&self.ipv6_mapping_method)?)
    }

    /// Worker-pool width for this backend's task queue
    pub fn concurrency(&self) -> usize {
        if self.allow_concurrent_tasks {
            self.max_concurrent_tasks.max(1) as usize
        } else {
            1
        }
    }

    pub fn has_api_credentials(&self) -> bool {
        self.api_token.is_some() || (self.api_cert.is_some() && self.api_cert_key.is_some())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InstanceRow {
    pub id: i64,
    pub uuid: String,
    pub user_id: i64,
    pub provider_id: i64,
    pub provider_name: String,
    pub name: String,
    pub kind: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub bandwidth_mbps: u32,
    pub image: String,
    pub image_url: Option<String>,
    pub os: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub ipv6: Option<String>,
    pub ssh_port: Option<i32>,
    pub port_range_start: Option<i32>,
    pub port_range_end: Option<i32>,
    pub mac: Option<String>,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_manual_expiry: bool,
    pub is_frozen: bool,
    pub frozen_reason: String,
    pub max_traffic_mb: u64,
    pub is_imported: bool,
    pub has_port_conflict: bool,
    pub discovered_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl InstanceRow {
    pub fn kind(&self) -> Result<InstanceKind> {
        Ok(InstanceKind::from_str(&self.kind)?)
    }

    pub fn status(&self) -> Result<InstanceStatus> {
        Ok(InstanceStatus::from_str(&self.status)?)
    }

    pub fn resources(&self) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
            bandwidth_mbps: self.bandwidth_mbps,
        }
    }
}

/// Insert payload for a new instance row
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub uuid: String,
    pub user_id: i64,
    pub provider_id: i64,
    pub provider_name: String,
    pub name: String,
    pub kind: InstanceKind,
    pub resources: ResourceVector,
    pub image: String,
    pub image_url: Option<String>,
    pub os: String,
    pub status: InstanceStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_manual_expiry: bool,
    pub max_traffic_mb: u64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PortMappingRow {
    pub id: i64,
    pub instance_id: i64,
    pub provider_id: i64,
    pub host_port: i32,
    pub guest_port: i32,
    pub protocol: String,
    pub mapping_method: String,
    pub status: String,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub port_type: String,
    pub ipv6_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PortMappingRow {
    pub fn protocol(&self) -> Result<Protocol> {
        Ok(Protocol::from_str(&self.protocol)?)
    }

    pub fn mapping_method(&self) -> Result<PortMappingMethod> {
        Ok(PortMappingMethod::from_str(&self.mapping_method)?)
    }

    pub fn status(&self) -> Result<MappingStatus> {
        Ok(MappingStatus::from_str(&self.status)?)
    }

    pub fn port_type(&self) -> Result<PortType> {
        Ok(PortType::from_str(&self.port_type)?)
    }
}

#[derive(Debug, Clone)]
pub struct NewPortMapping {
    pub instance_id: i64,
    pub provider_id: i64,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub mapping_method: PortMappingMethod,
    pub status: MappingStatus,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub port_type: PortType,
    pub ipv6_enabled: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub uuid: String,
    pub user_id: i64,
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub progress: i32,
    pub progress_message: String,
    pub timeout_seconds: i64,
    pub is_force_stoppable: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn task_type(&self) -> Result<TaskType> {
        Ok(TaskType::from_str(&self.task_type)?)
    }

    pub fn status(&self) -> Result<TaskStatus> {
        Ok(TaskStatus::from_str(&self.status)?)
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub uuid: String,
    pub user_id: i64,
    pub provider_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub timeout_seconds: i64,
    pub is_force_stoppable: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserQuotaRow {
    pub id: i64,
    pub level: i32,
    pub status: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_cpu_cores: u32,
    pub used_memory_mb: u64,
    pub used_disk_mb: u64,
    pub used_bandwidth_mbps: u32,
    pub pending_cpu_cores: u32,
    pub pending_memory_mb: u64,
    pub pending_disk_mb: u64,
    pub pending_bandwidth_mbps: u32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LevelLimits {
    pub level: i32,
    pub max_instances: i32,
    pub max_cpu_cores: u32,
    pub max_memory_mb: u64,
    pub max_disk_mb: u64,
    pub max_bandwidth_mbps: u32,
    pub max_traffic_mb: u64,
    pub expiry_days: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrafficSampleRow {
    pub id: i64,
    pub instance_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrafficHistoryRow {
    pub id: i64,
    pub instance_id: i64,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub traffic_in_mb: u64,
    pub traffic_out_mb: u64,
    pub total_used_mb: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemImageRow {
    pub id: i64,
    pub backend_kind: String,
    pub instance_kind: String,
    pub os: String,
    pub architecture: String,
    pub name: String,
    pub url: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConfigRow {
    pub id: i64,
    pub category: String,
    pub config_key: String,
    pub config_value: String,
    pub value_type: String,
    pub is_public: bool,
    pub updated_at: DateTime<Utc>,
}
