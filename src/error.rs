use thiserror::Error;

/// Top-level error type, covering failures below the transaction layer
/// (the Database Store's persistence) that the transaction manager folds
/// into its own `TransactionError` (see `transaction::error`).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(u32),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
