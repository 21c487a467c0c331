//! Error types for sources, storage and replication.

use thiserror::Error;

/// Error from a VPN source.
///
/// A hard error means the source is misconfigured and will not recover by
/// retrying; the orchestrator drops it from rotation for the rest of the
/// process. A soft error is transient and only skips this one call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[hard: {hard}] {message}")]
pub struct ApiError {
    /// Whether this failure is permanent.
    pub hard: bool,
    /// Human readable description.
    pub message: String,
}

impl ApiError {
    /// Create a permanent (misconfiguration) error.
    pub fn hard(message: impl Into<String>) -> Self {
        Self {
            hard: true,
            message: message.into(),
        }
    }

    /// Create a transient error.
    pub fn soft(message: impl Into<String>) -> Self {
        Self {
            hard: false,
            message: message.into(),
        }
    }

    /// Returns true if this error should exclude the source.
    pub fn is_hard(&self) -> bool {
        self.hard
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::soft("request timed out")
        } else {
            ApiError::soft(format!("http error: {}", e))
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::soft(format!("io error: {}", e))
    }
}

/// Error from a verdict store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The store has been closed.
    #[error("storage is closed")]
    Closed,

    /// Backend I/O failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A row referenced a surrogate ID that does not exist.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Backend(format!("blocking task failed: {}", e))
    }
}

/// Error from the replication bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    /// The bus has been closed.
    #[error("messaging is closed")]
    Closed,

    /// Message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// Message could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// Message could not be delivered.
    #[error("failed to send message: {0}")]
    Send(String),
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            MessagingError::Decode(e.to_string())
        } else {
            MessagingError::Encode(e.to_string())
        }
    }
}

/// Error surfaced to callers of a lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// The IP string could not be parsed.
    #[error("invalid ip address: {0}")]
    InvalidIp(String),

    /// Reading the verdict store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_constructors() {
        let hard = ApiError::hard("contact is not defined");
        assert!(hard.is_hard());
        assert_eq!(hard.to_string(), "[hard: true] contact is not defined");

        let soft = ApiError::soft("rate limited");
        assert!(!soft.is_hard());
    }

    #[test]
    fn test_io_error_is_soft() {
        let e: ApiError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(!e.is_hard());
    }

    #[test]
    fn test_lookup_error_wraps_storage() {
        let e: LookupError = StorageError::Closed.into();
        assert_eq!(e.to_string(), "storage is closed");
    }

    #[test]
    fn test_json_error_maps_to_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(MessagingError::from(err), MessagingError::Decode(_)));
    }
}
