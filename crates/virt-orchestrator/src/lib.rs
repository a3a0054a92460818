//! Composition root for the control plane
//!
//! Owns the connection registry, the driver factory, and the application
//! context an external HTTP layer drives.

pub mod app;
pub mod connections;
pub mod factory;

pub use app::{init_tracing, AppConfig, AppContext};
pub use connections::{target_from_row, ConnectionManager};
pub use factory::{profile_from_row, DriverFactory};
