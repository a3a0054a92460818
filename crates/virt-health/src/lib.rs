//! Backend health probes
//!
//! A leaf crate: it consumes the SSH command surface and plain HTTP, and is
//! itself consumed by the backend drivers. Nothing here depends on the
//! driver layer.

pub mod checker;
pub mod error;

pub use checker::{ApiProbe, CheckResult, HealthChecker, HealthResult, HealthState};
pub use error::{HealthError, Result};
