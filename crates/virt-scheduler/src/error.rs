use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] virt_db::DbError),

    #[error(transparent)]
    Driver(#[from] virt_backends::DriverError),

    #[error(transparent)]
    Resource(#[from] virt_resources::ResourceError),

    #[error(transparent)]
    Task(#[from] virt_tasks::TaskError),
}
