//! Delivery notifications.
//!
//! Alerting backends (chat, paging, email) plug in through [`Notifier`].
//! The aggregator calls it once per merged file with the delivery outcome.

use std::sync::{Mutex, PoisonError};

use achgate_core::ShardName;
use async_trait::async_trait;

/// Outcome carried by a [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    /// The merged file was delivered.
    Succeeded,
    /// Delivery failed.
    Failed {
        /// Error description.
        error: String,
    },
}

/// One delivery notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Shard the file belongs to.
    pub shard: ShardName,
    /// Merged file name.
    pub filename: String,
    /// Remote host the file was (or was to be) delivered to.
    pub hostname: String,
    /// Outcome.
    pub status: NotificationStatus,
    /// Entry records in the file.
    pub entries: usize,
    /// Total debits in cents.
    pub debit_total: u64,
    /// Total credits in cents.
    pub credit_total: u64,
}

/// Notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Sends a notification. Failures are the notifier's to log.
    async fn notify(&self, notification: &Notification);
}

/// Logs notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, n: &Notification) {
        match &n.status {
            NotificationStatus::Succeeded => tracing::info!(
                shard = %n.shard,
                filename = %n.filename,
                hostname = %n.hostname,
                entries = n.entries,
                debit_total = n.debit_total,
                credit_total = n.credit_total,
                "file uploaded"
            ),
            NotificationStatus::Failed { error } => tracing::error!(
                shard = %n.shard,
                filename = %n.filename,
                hostname = %n.hostname,
                error = %error,
                "file upload failed"
            ),
        }
    }
}

/// Keeps notifications for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
    }
}
