use thiserror::Error;

pub type Result<T> = std::result::Result<T, CirrusError>;

#[derive(Debug, Error)]
pub enum CirrusError {
    #[error("cache index: entry not found")]
    NotFound,

    #[error("cache config missing")]
    ConfigMissing,

    #[error("config validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("cache index: unknown schema version {0}")]
    UnknownSchema(u64),

    #[error("etag mismatch: remote object diverged from cache")]
    EtagMismatch,

    #[error("cache cleaner: capacity not reduced")]
    CapacityNotReduced,

    #[error("cache cleaner: fatal condition")]
    FatalCondition,

    #[error("cache failsafe: recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("cache failsafe: recovery in progress")]
    RecoveryInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("unsafe cache path: {0}")]
    InvalidPath(String),

    #[error("cache container is closed")]
    Closed,

    #[error("cache root is locked by another process ({0})")]
    Locked(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CirrusError {
    fn from(value: serde_json::Error) -> Self {
        CirrusError::Serialization(value.to_string())
    }
}

impl CirrusError {
    /// Whether an error is transient and worth retrying under backoff.
    ///
    /// Backend implementations mark network-level failures as `Transient`;
    /// a handful of I/O error kinds (connection drops, timeouts) are also
    /// treated as transient when they surface through `Io`.
    pub fn is_transient(&self) -> bool {
        match self {
            CirrusError::Transient(_) => true,
            CirrusError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

/// Whether an I/O error kind is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
