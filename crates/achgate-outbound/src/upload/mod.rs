//! Remote delivery collaborators.
//!
//! Transport clients (SFTP, FTP, ...) live outside achgate and plug in via
//! [`UploadAgent`]. Two agents ship with the crate:
//!
//! - [`memory::InMemoryAgent`] records uploads and can replay scripted
//!   failures; tests use it.
//! - [`local::LocalDirAgent`] writes into a local directory tree laid out
//!   like the remote server.
//!
//! [`retry::RetryAgent`] wraps any agent with Fibonacci backoff for
//! transient failures.

pub mod local;
pub mod memory;
pub mod retry;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A merged file ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    /// Remote file name (`<content hash>.ach`).
    pub filename: String,
    /// Encoded file bytes.
    pub contents: Vec<u8>,
}

/// Delivery failure reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// The remote did not answer in time.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Host resolution failed.
    #[error("dns: {0}")]
    Dns(String),
    /// Any other transport or remote failure.
    #[error("{0}")]
    Other(String),
}

impl UploadError {
    /// Creates an uncategorized error.
    #[must_use]
    pub fn other(message: impl fmt::Display) -> Self {
        Self::Other(message.to_string())
    }
}

/// Remote directory layout used by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentPaths {
    /// Where the bank drops files for us.
    pub inbound: String,
    /// Where we deliver merged files.
    pub outbound: String,
    /// Reconciliation reports.
    pub reconciliation: String,
    /// Returned entries.
    #[serde(rename = "return")]
    pub returns: String,
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self {
            inbound: "inbound".into(),
            outbound: "outbound".into(),
            reconciliation: "reconciliation".into(),
            returns: "returned".into(),
        }
    }
}

/// Remote delivery collaborator.
#[async_trait]
pub trait UploadAgent: Send + Sync + fmt::Debug {
    /// Writes `file` into the outbound directory.
    async fn upload_file(&self, file: &OutboundFile) -> Result<(), UploadError>;

    /// Removes a remote path.
    async fn delete(&self, path: &str) -> Result<(), UploadError>;

    /// Checks the remote is reachable.
    async fn ping(&self) -> Result<(), UploadError>;

    /// Remote directory layout.
    fn paths(&self) -> &AgentPaths;

    /// Remote host, for logs and notifications.
    fn hostname(&self) -> String;

    /// Inbound directory.
    fn inbound_path(&self) -> &str {
        &self.paths().inbound
    }

    /// Outbound directory.
    fn outbound_path(&self) -> &str {
        &self.paths().outbound
    }

    /// Reconciliation directory.
    fn reconciliation_path(&self) -> &str {
        &self.paths().reconciliation
    }

    /// Return directory.
    fn return_path(&self) -> &str {
        &self.paths().returns
    }
}
