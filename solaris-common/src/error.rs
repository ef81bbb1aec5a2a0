use thiserror::Error;

/// Error kinds shared by every component of the core. These are
/// conceptual categories, not a 1:1 mirror of any single upstream
/// error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotExist(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("already exists: {0}")]
    Exist(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("closed")]
    Closed,

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_exist(msg: impl Into<String>) -> Self {
        Error::NotExist(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corrupted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for errors that are recoverable by a single local retry
    /// (propagation policy: `Corrupted` gets one retry at the
    /// provider level).
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
