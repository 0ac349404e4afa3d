use std::fmt;

use thiserror::Error;

/// Errors reported by a document store, either from a direct call or pushed
/// through a subscription. Cloneable so a binding can keep it verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("subscription closed")]
    Closed,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl StoreError {
    /// Transient failures a caller may retry; the core itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Which write of a multi-step operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    CreateConversation,
    AppendMessage,
    UpdateSummary,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStep::CreateConversation => write!(f, "create conversation"),
            WriteStep::AppendMessage => write!(f, "append message"),
            WriteStep::UpdateSummary => write!(f, "update conversation summary"),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("subscription error: {0}")]
    Subscription(StoreError),

    #[error("read failed: {0}")]
    Read(StoreError),

    #[error("write failed ({step}): {source}")]
    WriteFailure { step: WriteStep, source: StoreError },
}

impl ChatError {
    pub fn write(step: WriteStep, source: StoreError) -> Self {
        ChatError::WriteFailure { step, source }
    }

    /// The underlying store error, if this failure came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ChatError::Subscription(e) | ChatError::Read(e) => Some(e),
            ChatError::WriteFailure { source, .. } => Some(source),
            ChatError::InvalidOperation(_) | ChatError::NotSignedIn => None,
        }
    }
}
