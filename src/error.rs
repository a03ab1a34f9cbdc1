use thiserror::Error;

#[derive(Error, Debug)]
pub enum JotDbError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("Duplicate key: {collection}/{id}")]
    DuplicateKey { collection: String, id: String },

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Transaction failed after {attempts} attempts: {source}")]
    TransactionFailed {
        attempts: usize,
        #[source]
        source: Box<JotDbError>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JotDbError>;

impl JotDbError {
    /// Transient engine contention (SQLITE_BUSY / SQLITE_LOCKED); the only
    /// class of failure an atomic unit retries.
    pub(crate) fn is_busy(&self) -> bool {
        match self {
            JotDbError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
