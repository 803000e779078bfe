use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient host error: {0}")]
    TransientHost(String),

    #[error("Logical inconsistency: {0}")]
    Logical(String),

    #[error("Set does not exist: {0}")]
    UnknownSet(String),

    #[error("Set is not a list set: {0}")]
    NotAListSet(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Failed to get lock")]
    FailedToGetLock,

    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),
}

impl Error {
    /// Transient errors are retried by the applier; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientHost(_))
    }
}
