//! Common types shared across virtflow crates
//!
//! This crate provides the domain vocabulary (backend kinds, network modes,
//! instance and task states, resource vectors, task payloads) so that service
//! crates do not depend on each other for plain data.

pub mod backend;
pub mod error;
pub mod instance;
pub mod network;
pub mod task;
pub mod validation;

pub use backend::*;
pub use error::*;
pub use instance::*;
pub use network::*;
pub use task::*;
pub use validation::*;
