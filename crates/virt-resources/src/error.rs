use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResourceError>;

#[derive(Debug, Error)]
pub enum ResourceError {
    /// The user's level limit would be exceeded; names the first
    /// overflowing dimension.
    #[error("Quota exceeded for {dimension}: requested {requested}, {available} available")]
    QuotaExceeded {
        dimension: &'static str,
        requested: u64,
        available: u64,
    },

    #[error("User has reached the instance limit of {max_instances}")]
    InstanceLimitReached { max_instances: i32 },

    /// The backend's physical capacity would be exceeded.
    #[error("Backend capacity exceeded for {dimension}: requested {requested}, {available} available")]
    CapacityExceeded {
        dimension: &'static str,
        requested: u64,
        available: u64,
    },

    #[error("No free ports in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("Port {host_port}/{protocol} already mapped on this backend")]
    PortConflict { host_port: u16, protocol: String },

    #[error(transparent)]
    Db(#[from] virt_db::DbError),

    #[error("Remote apply failed: {0}")]
    RemoteApply(String),

    #[error(transparent)]
    Ssh(#[from] virt_ssh::SshError),
}
