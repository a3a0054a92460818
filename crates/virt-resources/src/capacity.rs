//! Backend capacity plane

use sqlx::mysql::MySql;
use sqlx::Transaction;

use virt_db::{BackendRepo, BackendRow};
use virt_types::ResourceVector;

use crate::error::{ResourceError, Result};

pub struct CapacityService;

impl CapacityService {
    /// Reserve physical capacity inside the caller's transaction. On refusal
    /// the row is re-read under the same transaction to name the overflowing
    /// dimension.
    pub async fn reserve(
        tx: &mut Transaction<'static, MySql>,
        backend_id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        if BackendRepo::take_capacity(&mut **tx, backend_id, spec).await? {
            return Ok(());
        }
        let row = BackendRepo::get(&mut **tx, backend_id).await?;
        Err(Self::breakdown(&row, spec))
    }

    pub async fn release(
        tx: &mut Transaction<'static, MySql>,
        backend_id: i64,
        spec: &ResourceVector,
    ) -> Result<()> {
        BackendRepo::release_capacity(&mut **tx, backend_id, spec).await?;
        Ok(())
    }

    fn breakdown(row: &BackendRow, spec: &ResourceVector) -> ResourceError {
        let free_cpu = row.total_cpu_cores.saturating_sub(row.used_cpu_cores);
        if spec.cpu_cores > free_cpu {
            return ResourceError::CapacityExceeded {
                dimension: "cpu_cores",
                requested: spec.cpu_cores as u64,
                available: free_cpu as u64,
            };
        }
        let free_memory = row.total_memory_mb.saturating_sub(row.used_memory_mb);
        if spec.memory_mb > free_memory {
            return ResourceError::CapacityExceeded {
                dimension: "memory_mb",
                requested: spec.memory_mb,
                available: free_memory,
            };
        }
        let free_disk = row.total_disk_mb.saturating_sub(row.used_disk_mb);
        ResourceError::CapacityExceeded {
            dimension: "disk_mb",
            requested: spec.disk_mb,
            available: free_disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn backend(total: (u32, u64, u64), used: (u32, u64, u64)) -> BackendRow {
        BackendRow {
            id: 1,
            name: "b1".into(),
            kind: "lxd".into(),
            region: String::new(),
            architecture: "amd64".into(),
            host: "10.0.0.2".into(),
            ssh_port: 22,
            ssh_username: "root".into(),
            ssh_password: None,
            ssh_private_key: None,
            api_cert: None,
            api_cert_key: None,
            api_token: None,
            execution_rule: "auto".into(),
            allow_concurrent_tasks: false,
            max_concurrent_tasks: 1,
            ipv4_mapping_method: "device_proxy".into(),
            ipv6_mapping_method: "device_proxy".into(),
            network_type: "nat_ipv4".into(),
            traffic_count_mode: "both".into(),
            traffic_multiplier: 1.0,
            enable_traffic_control: true,
            port_range_start: 20000,
            port_range_end: 30000,
            total_cpu_cores: total.0,
            total_memory_mb: total.1,
            total_disk_mb: total.2,
            used_cpu_cores: used.0,
            used_memory_mb: used.1,
            used_disk_mb: used.2,
            status: "active".into(),
            is_frozen: false,
            frozen_at: None,
            frozen_reason: String::new(),
            expires_at: None,
            is_manual_expiry: false,
            public_ip: None,
            port_ip: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn breakdown_names_first_overflowing_dimension() {
        let row = backend((8, 16384, 102400), (7, 1024, 1024));
        let err = CapacityService::breakdown(&row, &ResourceVector::new(2, 2048, 10240, 100));
        match err {
            ResourceError::CapacityExceeded {
                dimension,
                requested,
                available,
            } => {
                assert_eq!(dimension, "cpu_cores");
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn breakdown_falls_through_to_memory() {
        let row = backend((8, 16384, 102400), (2, 15360, 0));
        let err = CapacityService::breakdown(&row, &ResourceVector::new(2, 2048, 10240, 100));
        assert!(matches!(
            err,
            ResourceError::CapacityExceeded {
                dimension: "memory_mb",
                ..
            }
        ));
    }
}
