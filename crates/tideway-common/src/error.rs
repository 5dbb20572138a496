//! Error types for tideway

use thiserror::Error;

/// Result type alias for tideway operations
pub type Result<T> = std::result::Result<T, TidewayError>;

/// Unified error type for all tideway operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TidewayError {
    /// Argument has the wrong shape (raised before any I/O)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Server rejected the operation
    #[error("Operation failure: {message}")]
    OperationFailure { message: String, code: Option<i32> },

    /// Collection already exists or failed a consistency check
    #[error("Collection invalid: {0}")]
    CollectionInvalid(String),

    /// Pool cannot hand out another connection
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No async runtime available to dispatch on
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TidewayError {
    /// Build an operation failure from a server message and optional code
    pub fn operation_failure(message: impl Into<String>, code: Option<i32>) -> Self {
        TidewayError::OperationFailure {
            message: message.into(),
            code,
        }
    }

    /// Server error code, if the server reported one
    pub fn code(&self) -> Option<i32> {
        match self {
            TidewayError::OperationFailure { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns true if the caller may reasonably retry the operation.
    ///
    /// Nothing in tideway retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TidewayError::Connection(_) | TidewayError::ResourceExhausted(_)
        )
    }

    /// Returns true if the error was raised before any I/O happened
    pub fn is_argument_error(&self) -> bool {
        matches!(self, TidewayError::InvalidArgument(_))
    }
}

impl From<serde_json::Error> for TidewayError {
    fn from(err: serde_json::Error) -> Self {
        TidewayError::Serialization(err.to_string())
    }
}

#[cfg(feature = "bson-errors")]
impl From<bson::ser::Error> for TidewayError {
    fn from(err: bson::ser::Error) -> Self {
        TidewayError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "bson-errors")]
impl From<bson::de::Error> for TidewayError {
    fn from(err: bson::de::Error) -> Self {
        TidewayError::Serialization(format!("BSON deserialization error: {}", err))
    }
}

#[cfg(feature = "bson-errors")]
impl From<bson::document::ValueAccessError> for TidewayError {
    fn from(err: bson::document::ValueAccessError) -> Self {
        TidewayError::Serialization(format!("BSON value access error: {}", err))
    }
}

#[cfg(feature = "url-errors")]
impl From<url::ParseError> for TidewayError {
    fn from(err: url::ParseError) -> Self {
        TidewayError::Configuration(format!("invalid endpoint: {}", err))
    }
}
