use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Pool exhausted")]
    PoolExhausted,

    #[error("Failed to get lock")]
    FailedToGetLock,

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Duplicate IP address: {0}")]
    DuplicateAddress(String),

    #[error("Unknown record: {0}")]
    UnknownRecord(String),

    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Empty lock file path")]
    EmptyLockPath,

    #[error("Lock is not held")]
    LockNotHeld,

    #[error("Unsupported state file version: {0}")]
    UnsupportedStateVersion(u64),
}
