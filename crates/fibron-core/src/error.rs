//! Unified error handling for Fibron.
//!
//! One error type shared by every crate in the workspace; variants map to
//! the user-visible error kinds surfaced over RPC.

/// Unified error type for Fibron.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Device, adapter or device type absent in memory and in the KV store.
    #[error("not found: {0}")]
    NotFound(String),

    /// An equivalent record already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Empty id, empty id list, malformed field value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation illegal in the current admin state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A lookup inside a composite operation failed.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Fewer devices loaded than requested.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// KV or adapter transport failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    pub fn data_loss(msg: impl Into<String>) -> Self {
        Self::DataLoss(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is the `NotFound` kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}
