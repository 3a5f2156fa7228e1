//! Metric names and label keys for the outbound pipeline.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `achgate_files_received_total` | Counter | `type` |
//! | `achgate_intake_dropped_total` | Counter | `reason` |
//! | `achgate_files_staged_total` | Counter | `shard` |
//! | `achgate_files_canceled_total` | Counter | `shard` |
//! | `achgate_cutoffs_total` | Counter | `shard`, `trigger` |
//! | `achgate_merge_errors_total` | Counter | `shard` |
//! | `achgate_files_uploaded_total` | Counter | `shard` |
//! | `achgate_upload_errors_total` | Counter | `shard` |
//! | `achgate_upload_retries_total` | Counter | - |
//! | `achgate_leader_skips_total` | Counter | `shard` |
//! | `achgate_cutoff_duration_seconds` | Histogram | `shard` |
//! | `achgate_cleanup_deleted_total` | Counter | - |
//! | `achgate_cleanup_errors_total` | Counter | - |
//! | `achgate_cleanup_missing_uploads` | Gauge | - |
//!
//! Values flow through an [`achgate_core::metrics::MetricsSink`]; the binary
//! wires [`achgate_core::metrics::FacadeMetrics`] and installs the
//! Prometheus exporter.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: messages received from intake subscriptions.
    pub const FILES_RECEIVED_TOTAL: &str = "achgate_files_received_total";
    /// Counter: intake messages dropped.
    pub const INTAKE_DROPPED_TOTAL: &str = "achgate_intake_dropped_total";
    /// Counter: files written to staging.
    pub const FILES_STAGED_TOTAL: &str = "achgate_files_staged_total";
    /// Counter: cancel requests applied.
    pub const FILES_CANCELED_TOTAL: &str = "achgate_files_canceled_total";
    /// Counter: cutoff cycles run.
    pub const CUTOFFS_TOTAL: &str = "achgate_cutoffs_total";
    /// Counter: per-file merge failures.
    pub const MERGE_ERRORS_TOTAL: &str = "achgate_merge_errors_total";
    /// Counter: merged files delivered.
    pub const FILES_UPLOADED_TOTAL: &str = "achgate_files_uploaded_total";
    /// Counter: merged files whose delivery failed.
    pub const UPLOAD_ERRORS_TOTAL: &str = "achgate_upload_errors_total";
    /// Counter: delivery retry attempts.
    pub const UPLOAD_RETRIES_TOTAL: &str = "achgate_upload_retries_total";
    /// Counter: merged files skipped because this instance was not leader.
    pub const LEADER_SKIPS_TOTAL: &str = "achgate_leader_skips_total";
    /// Histogram: cutoff cycle duration in seconds.
    pub const CUTOFF_DURATION_SECONDS: &str = "achgate_cutoff_duration_seconds";
    /// Counter: isolated batches deleted by cleanup.
    pub const CLEANUP_DELETED_TOTAL: &str = "achgate_cleanup_deleted_total";
    /// Counter: cleanup failures.
    pub const CLEANUP_ERRORS_TOTAL: &str = "achgate_cleanup_errors_total";
    /// Gauge: expired batches without upload evidence at the last sweep.
    pub const CLEANUP_MISSING_UPLOADS: &str = "achgate_cleanup_missing_uploads";
}

/// Label keys used across metrics.
pub mod labels {
    /// Shard name.
    pub const SHARD: &str = "shard";
    /// Envelope type of a received message.
    pub const TYPE: &str = "type";
    /// Why a message was dropped.
    pub const REASON: &str = "reason";
    /// `scheduled` or `manual`.
    pub const TRIGGER: &str = "trigger";
}

/// Registers metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::FILES_RECEIVED_TOTAL, "Messages received from intake");
    describe_counter!(names::INTAKE_DROPPED_TOTAL, "Intake messages dropped");
    describe_counter!(names::FILES_STAGED_TOTAL, "Files written to staging");
    describe_counter!(names::FILES_CANCELED_TOTAL, "Cancel requests applied");
    describe_counter!(names::CUTOFFS_TOTAL, "Cutoff cycles run");
    describe_counter!(names::MERGE_ERRORS_TOTAL, "Staged files that failed to merge");
    describe_counter!(names::FILES_UPLOADED_TOTAL, "Merged files delivered");
    describe_counter!(names::UPLOAD_ERRORS_TOTAL, "Merged files whose delivery failed");
    describe_counter!(names::UPLOAD_RETRIES_TOTAL, "Delivery retry attempts");
    describe_counter!(names::LEADER_SKIPS_TOTAL, "Deliveries skipped by non-leaders");
    describe_histogram!(names::CUTOFF_DURATION_SECONDS, "Duration of cutoff cycles in seconds");
    describe_counter!(names::CLEANUP_DELETED_TOTAL, "Isolated batches deleted");
    describe_counter!(names::CLEANUP_ERRORS_TOTAL, "Cleanup failures");
    describe_gauge!(names::CLEANUP_MISSING_UPLOADS, "Expired batches lacking upload evidence");
}
