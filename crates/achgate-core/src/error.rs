//! Shared error type for achgate components.
//!
//! Outbound code wraps this in its own error enum; the variants here cover
//! what the core primitives can fail on: bad identifiers, malformed ACH
//! content, filesystem access and (de)serialization.

use std::fmt;

/// The result type used throughout achgate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by achgate-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier is not a safe, single path segment.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Why the identifier was rejected.
        message: String,
    },

    /// An ACH file or envelope failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A filesystem operation on the staging tree failed.
    #[error("storage error: {message}")]
    Storage {
        /// The operation and path involved.
        message: String,
        /// Underlying I/O error, when there is one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Bytes could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Decoder or encoder message.
        message: String,
    },
}

impl Error {
    /// A storage error without an underlying cause.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// A storage error wrapping `source`.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// A serialization error from anything displayable.
    #[must_use]
    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// True when the error wraps an I/O `NotFound`.
    ///
    /// Staging writers use this to detect a directory that was isolated
    /// away underneath them.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage {
                source: Some(source),
                ..
            } => source
                .downcast_ref::<std::io::Error>()
                .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use super::*;

    #[test]
    fn missing_paths_are_detected() {
        let err = Error::storage_with_source(
            "rename mergable/testing/s1/.f1.ach.tmp",
            io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
        );
        assert!(err.is_not_found());
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("storage error: rename"));
    }

    #[test]
    fn other_failures_are_not_not_found() {
        let denied = Error::storage_with_source(
            "write",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!denied.is_not_found());
        assert!(!Error::storage("plain").is_not_found());
        assert!(!Error::serialization("eof").is_not_found());
    }
}
