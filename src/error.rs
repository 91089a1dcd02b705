use thiserror::Error;

use crate::models::ColumnGroup;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote sheet error: {0}")]
    Remote(String),

    #[error("Integrity violation for user {user} ({group}) at row {row}: {reason}")]
    Integrity {
        user: String,
        group: ColumnGroup,
        row: u32,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No open reservation for cache id: {0}")]
    UnknownReservation(String),

    #[error("Upload queue is not running")]
    QueueStopped,

    #[error("Unknown column group: {0}")]
    UnknownGroup(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
