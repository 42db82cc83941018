use thiserror::Error;

/// Failure taxonomy shared by the merge engine, the evaluator and every store backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// Persisted state violates the history invariants. Never repaired automatically.
    #[error("History store is corrupt: {0}")]
    CorruptStore(String),
    /// The incoming run (or the evaluation configuration applied to it) is malformed.
    #[error("Run rejected: {0}")]
    InvalidRun(String),
    /// The persisted history changed between `load` and `commit`.
    #[error("History was modified concurrently, reload and merge again")]
    StaleWrite,
    /// Storage is unavailable or the retry budget is exhausted.
    #[error("Failed to persist history: {0}")]
    PersistFailed(String),
}

impl IngestError {
    pub fn corrupt<T: Into<String>>(msg: T) -> Self {
        IngestError::CorruptStore(msg.into())
    }

    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        IngestError::InvalidRun(msg.into())
    }

    pub fn persist<T: Into<String>>(msg: T) -> Self {
        IngestError::PersistFailed(msg.into())
    }

    /// only a lost optimistic-concurrency race is worth another round
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StaleWrite)
    }
}
