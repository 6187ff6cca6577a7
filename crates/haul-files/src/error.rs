//! Error types for file hashing and share registration

use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the hash queue
#[derive(Debug, Error, Clone)]
pub enum FilesError {
    /// Reading a file failed
    #[error("File I/O error: {0}")]
    Io(String),

    /// The share registry refused a registration
    #[error("Registration failed: {0}")]
    Registration(Cow<'static, str>),

    /// The hash queue stopped permanently
    #[error("Subsystem stopped: {0}")]
    SubsystemFatal(Cow<'static, str>),
}

impl FilesError {
    /// Create a registration error with static context (zero allocation)
    #[must_use]
    pub const fn registration(context: &'static str) -> Self {
        FilesError::Registration(Cow::Borrowed(context))
    }

    /// True if the whole subsystem is gone, not just one request
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, FilesError::SubsystemFatal(_))
    }
}

impl From<std::io::Error> for FilesError {
    fn from(err: std::io::Error) -> Self {
        FilesError::Io(err.to_string())
    }
}
