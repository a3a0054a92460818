//! Resource accounting and port planning
//!
//! Two accounting planes kept in sync inside the instance-write transaction
//! (backend capacity, user quota), the host-port allocator, and the planner
//! that realises mappings on the remote.

pub mod capacity;
pub mod error;
pub mod planner;
pub mod ports;
pub mod quota;
pub mod traffic;

pub use capacity::CapacityService;
pub use error::{ResourceError, Result};
pub use planner::{
    firewall_open_commands, iptables_add_commands, iptables_remove_commands, proxy_add_commands,
    proxy_add_range_commands, proxy_device_name, proxy_remove_commands, FirewallKind,
    MappingParams, PortPlanner, IPTABLES_PERSIST,
};
pub use ports::PortAllocator;
pub use quota::QuotaService;
pub use traffic::{
    billable_mb, segment_samples, window_totals, Segment, TrafficAggregator, Window,
};
