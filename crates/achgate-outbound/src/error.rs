//! Error types for the outbound pipeline.

use achgate_core::ShardName;

/// The result type used throughout achgate-outbound.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in outbound pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from achgate-core.
    #[error("core error: {0}")]
    Core(#[from] achgate_core::Error),

    /// A cutoff schedule could not be built.
    #[error("invalid cutoff: {message}")]
    InvalidCutoff {
        /// Description of the problem.
        message: String,
    },

    /// The configured timezone is not a known IANA zone.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    /// A remote delivery failed.
    #[error("upload failed: {0}")]
    Upload(#[from] crate::upload::UploadError),

    /// The leader elector backend failed.
    #[error("leadership error: {message}")]
    Leadership {
        /// Description of the failure.
        message: String,
    },

    /// No aggregator is registered for a shard.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardName),

    /// A message could not be routed to an aggregator.
    #[error("routing error: {message}")]
    Routing {
        /// Description of the failure.
        message: String,
    },

    /// A channel closed before the operation completed.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Some staged files in a batch failed to process.
    #[error("{} file(s) failed: {}", failures.len(), failures.join("; "))]
    PartialMerge {
        /// One entry per failed file or merged output.
        failures: Vec<String>,
    },
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a routing error.
    #[must_use]
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Creates an invalid cutoff error.
    #[must_use]
    pub fn invalid_cutoff(message: impl Into<String>) -> Self {
        Self::InvalidCutoff {
            message: message.into(),
        }
    }
}
