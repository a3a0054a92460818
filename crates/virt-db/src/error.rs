use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Guarded update touched no rows: {0}")]
    GuardViolation(&'static str),

    #[error("Reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectFailed { attempts: u32, last_error: String },

    #[error(transparent)]
    Invalid(#[from] virt_types::CommonError),
}

impl DbError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        DbError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}
