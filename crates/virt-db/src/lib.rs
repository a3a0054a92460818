//! Database layer: the pool manager and typed repositories
//!
//! Repositories are stateless; every method takes an executor so callers can
//! pass either the pool or an open transaction. Mutations that carry an
//! invariant (capacity bounds, quota bounds, claim-exactly-once) are
//! WHERE-guarded so a violated guard surfaces instead of corrupting counters.

pub mod backends;
pub mod config;
pub mod error;
pub mod images;
pub mod instances;
pub mod manager;
pub mod models;
pub mod ports;
pub mod quota;
pub mod tasks;
pub mod traffic;

pub use backends::BackendRepo;
pub use config::ConfigRepo;
pub use error::{DbError, Result};
pub use images::SystemImageRepo;
pub use instances::InstanceRepo;
pub use manager::{with_read_retry, DbConfig, DbManager};
pub use models::*;
pub use ports::PortMappingRepo;
pub use quota::QuotaRepo;
pub use tasks::TaskRepo;
pub use traffic::TrafficRepo;
