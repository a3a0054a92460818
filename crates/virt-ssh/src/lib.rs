//! SSH transport for backend hosts
//!
//! One `SshClient` per backend, shared between the orchestrator and any
//! borrowed-mode health checker. Dialing verifies that the peer address
//! belongs to the configured host and fails closed otherwise.

pub mod client;
pub mod error;
pub mod sftp;

pub use client::{peer_matches, CommandOutput, SshClient, SshTarget};
pub use error::{Result, SshError};
