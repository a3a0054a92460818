use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Db(#[from] virt_db::DbError),

    #[error(transparent)]
    Driver(#[from] virt_backends::DriverError),

    #[error(transparent)]
    Resource(#[from] virt_resources::ResourceError),

    #[error(transparent)]
    Ssh(#[from] virt_ssh::SshError),

    #[error("Invalid task payload: {0}")]
    Payload(String),

    #[error("Task not permitted: {0}")]
    Forbidden(String),

    #[error("Task timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task handler panicked: {0}")]
    Panic(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Payload(e.to_string())
    }
}

impl From<virt_types::CommonError> for TaskError {
    fn from(e: virt_types::CommonError) -> Self {
        TaskError::Payload(e.to_string())
    }
}
