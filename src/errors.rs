use thiserror::Error;

/// Every failure the engine can surface. `PageFull` and `NotFound` are
/// usually recovered internally (by allocating a fresh stripe or reading
/// from disk); the rest propagate to callers and, inside a transaction,
/// trigger rollback.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Insert of a primary key that is already live.
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),

    /// Update, delete, or keyed lookup of a primary key that does not exist.
    #[error("no record with primary key {0}")]
    MissingKey(i64),

    /// Read of a base record whose latest version is a tombstone.
    #[error("record was deleted")]
    Deleted,

    /// A physical page has no room for another value.
    #[error("page is full")]
    PageFull,

    /// A page file was requested that does not exist on disk.
    #[error("page {pages_id} column {col} not found on disk")]
    NotFound { pages_id: u64, col: usize },

    /// A record lock could not be acquired within the retry budget.
    #[error("lock conflict on key {0}")]
    Conflict(i64),

    /// A persistent UID counter ran out of identifiers. Fatal.
    #[error("uid space for '{0}' exhausted")]
    CapacityExhausted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Metadata(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
