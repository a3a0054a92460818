use std::net::IpAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SshError>;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("Unable to resolve {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("Peer address {actual} does not match any address of configured host {host}")]
    PeerMismatch { host: String, actual: IpAddr },

    #[error("Connection to {host}:{port} timed out after {seconds}s")]
    ConnectTimeout {
        host: String,
        port: u16,
        seconds: u64,
    },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("No SSH credentials configured for {host}")]
    NoCredentials { host: String },

    #[error("Authentication failed for user {username}")]
    AuthFailed { username: String },

    #[error("Private key rejected: {0}")]
    KeyInvalid(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Session open failed: {0}")]
    SessionFailed(String),

    #[error("Command timed out after {seconds}s: {command}")]
    ExecuteTimeout { command: String, seconds: u64 },

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),
}
