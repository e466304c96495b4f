use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreErr>;

#[derive(Error, Debug)]
pub enum StoreErr {
    #[error("session '{name}' already exists (pick a different name)")]
    DuplicateSession { name: String },

    #[error("session not found: {ident}")]
    SessionNotFound { ident: String },

    /// Optimistic-lock mismatch: someone updated the row after the caller
    /// last read it.
    #[error("session '{ident}' was modified concurrently; re-read and retry")]
    Conflict { ident: String },

    #[error("migration to schema version {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("database integrity check failed: {report}")]
    Integrity { report: String },

    #[error("could not open session database: {reason}")]
    Connection { reason: String },

    #[error("invalid session {field}: {reason}")]
    InvalidSession { field: String, reason: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
