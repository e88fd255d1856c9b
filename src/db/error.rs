use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanDbError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] r2d2::Error),

    #[error("Database execution error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("Row mapping error: {0}")]
    SerdeRusqlite(#[from] serde_rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking database task failed: {0}")]
    TaskJoin(String),
}

// Convenience alias
pub type ScanDbResult<T> = Result<T, ScanDbError>;
