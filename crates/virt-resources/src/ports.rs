//! Host-port allocation
//!
//! Allocation scans the backend's configured range, skipping every port the
//! mapping table or an instance row (ssh_port, port_range_*) already holds.
//! Contiguous allocations coalesce into ranges for the range-mapping path.

use std::collections::BTreeSet;

use sqlx::mysql::MySqlPool;

use virt_db::{BackendRow, InstanceRepo, PortMappingRepo};

use crate::error::{ResourceError, Result};

pub struct PortAllocator;

impl PortAllocator {
    /// Everything currently spoken for on a backend: live mapping rows plus
    /// ports recorded directly on instance rows.
    pub async fn reserved_set(pool: &MySqlPool, provider_id: i64) -> Result<BTreeSet<u16>> {
        let mut reserved = BTreeSet::new();

        for mapping in PortMappingRepo::reserved_host_ports(pool, provider_id).await? {
            reserved.insert(mapping.host_port as u16);
        }

        for (ssh_port, range_start, range_end) in
            InstanceRepo::reserved_ports(pool, provider_id).await?
        {
            if let Some(port) = ssh_port {
                reserved.insert(port as u16);
            }
            if let (Some(start), Some(end)) = (range_start, range_end) {
                for port in start..=end {
                    reserved.insert(port as u16);
                }
            }
        }

        Ok(reserved)
    }

    /// First-fit scan: `count` ports from the range, lowest first.
    pub fn allocate_from(
        range_start: u16,
        range_end: u16,
        reserved: &BTreeSet<u16>,
        count: usize,
    ) -> Result<Vec<u16>> {
        let mut allocated = Vec::with_capacity(count);
        for port in range_start..=range_end {
            if reserved.contains(&port) {
                continue;
            }
            allocated.push(port);
            if allocated.len() == count {
                return Ok(allocated);
            }
        }
        Err(ResourceError::NoPortsAvailable {
            start: range_start,
            end: range_end,
        })
    }

    /// Allocate against the live reservation state of a backend.
    pub async fn allocate(
        pool: &MySqlPool,
        backend: &BackendRow,
        count: usize,
    ) -> Result<Vec<u16>> {
        let reserved = Self::reserved_set(pool, backend.id).await?;
        Self::allocate_from(
            backend.port_range_start as u16,
            backend.port_range_end as u16,
            &reserved,
            count,
        )
    }

    /// Collapse sorted ports into inclusive contiguous ranges.
    pub fn coalesce(ports: &[u16]) -> Vec<(u16, u16)> {
        let mut sorted: Vec<u16> = ports.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut ranges = Vec::new();
        let mut iter = sorted.into_iter();
        let Some(first) = iter.next() else {
            return ranges;
        };
        let (mut start, mut end) = (first, first);
        for port in iter {
            if port == end + 1 {
                end = port;
            } else {
                ranges.push((start, end));
                start = port;
                end = port;
            }
        }
        ranges.push((start, end));
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocation_skips_reserved() {
        let reserved: BTreeSet<u16> = [20000, 20001, 20003].into_iter().collect();
        let ports = PortAllocator::allocate_from(20000, 20010, &reserved, 3).unwrap();
        assert_eq!(ports, vec![20002, 20004, 20005]);
    }

    #[test]
    fn exhaustion_is_typed() {
        let reserved: BTreeSet<u16> = (20000..=20005).collect();
        let err = PortAllocator::allocate_from(20000, 20005, &reserved, 1).unwrap_err();
        assert!(matches!(err, ResourceError::NoPortsAvailable { .. }));
    }

    #[test]
    fn coalesce_contiguous_runs() {
        let ranges = PortAllocator::coalesce(&[20000, 20001, 20002, 20005, 20007, 20008]);
        assert_eq!(ranges, vec![(20000, 20002), (20005, 20005), (20007, 20008)]);
    }

    #[test]
    fn coalesce_empty() {
        assert!(PortAllocator::coalesce(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn coalesced_ranges_cover_exactly_the_input(ports in proptest::collection::btree_set(20000u16..21000, 0..64)) {
            let input: Vec<u16> = ports.iter().copied().collect();
            let ranges = PortAllocator::coalesce(&input);

            let mut covered = BTreeSet::new();
            for (start, end) in &ranges {
                prop_assert!(start <= end);
                for port in *start..=*end {
                    prop_assert!(covered.insert(port), "ranges overlap at {}", port);
                }
            }
            prop_assert_eq!(covered, ports);
        }

        #[test]
        fn allocation_never_returns_reserved(
            reserved in proptest::collection::btree_set(20000u16..20050, 0..40),
            count in 1usize..8,
        ) {
            match PortAllocator::allocate_from(20000, 20049, &reserved, count) {
                Ok(ports) => {
                    prop_assert_eq!(ports.len(), count);
                    for port in ports {
                        prop_assert!(!reserved.contains(&port));
                    }
                }
                Err(ResourceError::NoPortsAvailable { .. }) => {
                    prop_assert!(50 - reserved.len() < count);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
