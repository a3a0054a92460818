//! Typed driver errors
//!
//! The task engine matches on these variants to decide retry and cleanup
//! behaviour; drivers never rely on error-string matching.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    /// Remote state missing (instance, image). Swallowed into success on
    /// delete; terminal on create/reset.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Remote timeout, connection drop, lock contention. Retried per the
    /// caller's budget.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Payload malformed or policy-forbidden. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The backend cannot do this at all (e.g. Docker runtime port change)
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Unrecoverable remote misconfiguration. Never retried.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Transient(_) | DriverError::NotConnected(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

impl From<virt_ssh::SshError> for DriverError {
    fn from(e: virt_ssh::SshError) -> Self {
        use virt_ssh::SshError;
        match e {
            SshError::AuthFailed { .. } | SshError::NoCredentials { .. } => {
                DriverError::Unauthorized(e.to_string())
            }
            SshError::PeerMismatch { .. } => DriverError::Fatal(e.to_string()),
            SshError::NotConnected => DriverError::NotConnected(e.to_string()),
            SshError::ExecuteTimeout { .. }
            | SshError::ConnectTimeout { .. }
            | SshError::SessionFailed(_)
            | SshError::Connection(_) => DriverError::Transient(e.to_string()),
            other => DriverError::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            match status.as_u16() {
                401 | 403 => return DriverError::Unauthorized(e.to_string()),
                404 => return DriverError::NotFound(e.to_string()),
                _ => {}
            }
        }
        if e.is_timeout() || e.is_connect() {
            DriverError::NotConnected(e.to_string())
        } else {
            DriverError::Transient(e.to_string())
        }
    }
}

impl From<bollard::errors::Error> for DriverError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match &e {
            B::DockerResponseServerError {
                status_code,
                message,
            } => match *status_code {
                404 => DriverError::NotFound(message.clone()),
                409 => DriverError::AlreadyExists(message.clone()),
                401 | 403 => DriverError::Unauthorized(message.clone()),
                _ => DriverError::Transient(message.clone()),
            },
            B::RequestTimeoutError => DriverError::Transient(e.to_string()),
            _ => DriverError::Transient(e.to_string()),
        }
    }
}
