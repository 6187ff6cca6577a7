//! Error types for the upload queue core
//!
//! Errors are grouped by where they surface and whether they are worth
//! retrying.
//!
//! # Error Categories
//!
//! - **Per-item**: validation failures and backend failures. These never cross
//!   the scheduler tick boundary; they are folded into item state plus a
//!   human-readable description.
//! - **Cross-cutting**: storage failures. These propagate as typed results to
//!   whoever invoked persistence.
//!
//! A background worker giving up permanently is reported by the crate that
//! owns the worker (`haul_files::FilesError::SubsystemFatal`).
//!
//! # Example
//!
//! ```
//! use haul_core::QueueError;
//!
//! fn describe(err: &QueueError) -> &'static str {
//!     if err.is_transient() {
//!         "will retry after backoff"
//!     } else {
//!         "needs user intervention"
//!     }
//! }
//!
//! assert_eq!(describe(&QueueError::backend_retryable("node busy")), "will retry after backoff");
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the upload queue core
#[derive(Debug, Error, Clone)]
pub enum QueueError {
    // ============ Per-item Errors ============
    /// Backing file is missing or changed size since it was queued
    #[error("Validation failed: {0}")]
    Validation(Cow<'static, str>),

    /// Backend reported a failure that will not succeed on retry
    #[error("Backend error: {0}")]
    BackendFatal(Cow<'static, str>),

    /// Backend reported a failure that may succeed on a later attempt
    #[error("Backend error (retryable): {0}")]
    BackendRetryable(Cow<'static, str>),

    /// User-supplied crypto key is malformed
    #[error("Invalid crypto key: {0}")]
    InvalidKey(Cow<'static, str>),

    /// Item is not present in the collection
    #[error("Item not found: {0}")]
    NotFound(String),

    // ============ Cross-cutting Errors ============
    /// Loading or saving the queue failed
    #[error("Storage error: {0}")]
    Storage(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl QueueError {
    /// Returns true if this error may succeed on a later attempt
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::BackendRetryable(_) | QueueError::Channel(_) | QueueError::Io(_)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            QueueError::Validation(_)
                | QueueError::BackendFatal(_)
                | QueueError::InvalidKey(_)
                | QueueError::InvalidConfig(_)
                | QueueError::NotFound(_)
        )
    }

    /// Message without the category prefix
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            QueueError::Validation(s)
            | QueueError::BackendFatal(s)
            | QueueError::BackendRetryable(s)
            | QueueError::InvalidKey(s)
            | QueueError::Storage(s)
            | QueueError::Serialization(s)
            | QueueError::InvalidConfig(s)
            | QueueError::Channel(s) => s.as_ref(),
            QueueError::NotFound(s) | QueueError::Io(s) => s.as_str(),
        }
    }

    /// Create a validation error with static context (zero allocation)
    #[must_use]
    pub const fn validation(context: &'static str) -> Self {
        QueueError::Validation(Cow::Borrowed(context))
    }

    /// Create a fatal backend error with static context (zero allocation)
    #[must_use]
    pub const fn backend_fatal(context: &'static str) -> Self {
        QueueError::BackendFatal(Cow::Borrowed(context))
    }

    /// Create a retryable backend error with static context (zero allocation)
    #[must_use]
    pub const fn backend_retryable(context: &'static str) -> Self {
        QueueError::BackendRetryable(Cow::Borrowed(context))
    }

    /// Create a storage error with static context (zero allocation)
    #[must_use]
    pub const fn storage(context: &'static str) -> Self {
        QueueError::Storage(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        QueueError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(QueueError::backend_retryable("timeout").is_transient());
        assert!(QueueError::Channel(Cow::Borrowed("closed")).is_transient());
        assert!(QueueError::Io("disk busy".to_string()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(QueueError::validation("missing").is_permanent());
        assert!(QueueError::backend_fatal("rejected").is_permanent());
        assert!(QueueError::InvalidKey(Cow::Borrowed("short")).is_permanent());
        assert!(QueueError::NotFound("abc".to_string()).is_permanent());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            QueueError::validation("missing"),
            QueueError::backend_fatal("rejected"),
            QueueError::backend_retryable("busy"),
            QueueError::storage("write failed"),
            QueueError::invalid_config("zero slots"),
        ];

        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::storage("queue file unreadable");
        assert_eq!(err.to_string(), "Storage error: queue file unreadable");

        let err = QueueError::NotFound("haul-0011".to_string());
        assert!(err.to_string().contains("haul-0011"));
    }

    #[test]
    fn test_detail_drops_prefix() {
        let err = QueueError::backend_retryable("node busy");
        assert_eq!(err.to_string(), "Backend error (retryable): node busy");
        assert_eq!(err.detail(), "node busy");
        assert_eq!(QueueError::Io("disk full".to_string()).detail(), "disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: QueueError = io_err.into();
        assert!(matches!(err, QueueError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
