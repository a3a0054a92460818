use thiserror::Error;

pub type Result<T> = std::result::Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("SSH error: {0}")]
    Ssh(#[from] virt_ssh::SshError),

    #[error("API probe error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Checker misconfigured: {0}")]
    Config(String),
}
