//! Per-shard coordinator.
//!
//! One [`ShardAggregator`] exists per configured shard. It stages incoming
//! files immediately, and on each cutoff (scheduled tick or manual trigger)
//! isolates the staging directory, merges it and delivers every merged file
//! through the leader gate and upload agent.
//!
//! Scheduled ticks and manual triggers feed the same single control loop,
//! so at most one cutoff cycle per shard is ever in flight. Cancelling the
//! loop lets a running cycle finish before the loop exits.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use achgate_core::envelope::{CancelRequest, CutoffCompleted, Event, FileUploaded, IncomingFile};
use achgate_core::metrics::{self as core_metrics, MetricsSink};
use achgate_core::ShardName;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{EventEmitter, LoggingEmitter};
use crate::leader::LeaderGate;
use crate::metrics::{labels, names};
use crate::notify::{Notification, NotificationStatus, Notifier};
use crate::schedule::{CutoffScheduler, Day};
use crate::store::{Deliver, Delivery, MergedFile, TransferStore};
use crate::upload::{OutboundFile, UploadAgent};

const MANUAL_QUEUE: usize = 8;

/// What started a cutoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffKind {
    /// A scheduler tick.
    Scheduled,
    /// An operator request.
    Manual,
}

impl CutoffKind {
    /// Label value for metrics and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// Result of one cutoff cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutoffSummary {
    /// Isolated batch directory.
    pub batch_dir: PathBuf,
    /// Merged files produced.
    pub merged_files: usize,
    /// Merged files delivered by this instance.
    pub uploaded: usize,
    /// Merged files skipped as non-leader.
    pub skipped: usize,
    /// Per-file failures.
    pub failures: Vec<String>,
}

impl CutoffSummary {
    /// Turns recorded failures into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialMerge`] when any file failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialMerge {
                failures: self.failures,
            })
        }
    }
}

/// A manual cutoff request; the outcome is sent on `respond`.
#[derive(Debug)]
pub struct ManualCutoff {
    /// Receives the cycle's outcome.
    pub respond: oneshot::Sender<Result<CutoffSummary>>,
}

/// Per-shard coordinator.
#[derive(Debug)]
pub struct ShardAggregator {
    store: TransferStore,
    scheduler: Option<CutoffScheduler>,
    ticks: Mutex<Option<mpsc::Receiver<Day>>>,
    gate: Arc<LeaderGate>,
    agent: Arc<dyn UploadAgent>,
    emitter: Arc<dyn EventEmitter>,
    notifier: Option<Arc<dyn Notifier>>,
    metrics: Arc<dyn MetricsSink>,
    manual_tx: mpsc::Sender<ManualCutoff>,
    manual_rx: Mutex<Option<mpsc::Receiver<ManualCutoff>>>,
}

impl ShardAggregator {
    /// Creates an aggregator with no schedule, a logging emitter, no
    /// notifier and no metrics.
    #[must_use]
    pub fn new(store: TransferStore, gate: Arc<LeaderGate>, agent: Arc<dyn UploadAgent>) -> Self {
        let (manual_tx, manual_rx) = mpsc::channel(MANUAL_QUEUE);
        Self {
            store,
            scheduler: None,
            ticks: Mutex::new(None),
            gate,
            agent,
            emitter: Arc::new(LoggingEmitter),
            notifier: None,
            metrics: core_metrics::noop(),
            manual_tx,
            manual_rx: Mutex::new(Some(manual_rx)),
        }
    }

    /// Runs cutoffs on `scheduler`'s ticks.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: CutoffScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Runs cutoffs on ticks read from `ticks` instead of a scheduler.
    #[must_use]
    pub fn with_ticks(self, ticks: mpsc::Receiver<Day>) -> Self {
        *self.ticks.lock().unwrap_or_else(PoisonError::into_inner) = Some(ticks);
        self
    }

    /// Publishes lifecycle events to `emitter`.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Sends delivery notifications to `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Records metrics on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The shard this aggregator owns.
    #[must_use]
    pub fn shard(&self) -> &ShardName {
        self.store.shard()
    }

    /// The shard's staging store.
    #[must_use]
    pub fn store(&self) -> &TransferStore {
        &self.store
    }

    /// Sender feeding manual cutoffs into the control loop.
    #[must_use]
    pub fn manual_trigger(&self) -> mpsc::Sender<ManualCutoff> {
        self.manual_tx.clone()
    }

    /// Stages an incoming file.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn accept_file(&self, incoming: &IncomingFile) -> Result<()> {
        self.store.handle_transfer(incoming).await
    }

    /// Applies a cancel request.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the cancel.
    pub async fn cancel_file(&self, cancel: &CancelRequest) -> Result<()> {
        self.store.handle_cancel(cancel).await
    }

    /// Requests a cutoff through the control loop and waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] when the loop is not running, or the
    /// cycle's own error.
    pub async fn trigger_cutoff(&self) -> Result<CutoffSummary> {
        crate::trigger::request(&self.manual_tx).await
    }

    /// Starts the control loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop was already started or the scheduler
    /// cannot start.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut manual_rx = self
            .manual_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::config(format!("aggregator {} already started", self.shard())))?;
        let fed = self.ticks.lock().unwrap_or_else(PoisonError::into_inner).take();
        let mut ticks = match fed {
            Some(rx) => Some(rx),
            None => self.scheduler.as_ref().map(CutoffScheduler::start).transpose()?,
        };

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tracing::info!(shard = %this.shard(), "aggregator started");
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    Some(day) = next_tick(&mut ticks) => this.on_tick(&day).await,
                    Some(request) = manual_rx.recv() => {
                        let outcome = this
                            .run_cutoff(CutoffKind::Manual)
                            .await
                            .and_then(CutoffSummary::into_result);
                        if request.respond.send(outcome).is_err() {
                            tracing::debug!(shard = %this.shard(), "manual cutoff caller went away");
                        }
                    }
                    else => break,
                }
            }
            if let Some(scheduler) = &this.scheduler {
                scheduler.stop();
            }
            tracing::info!(shard = %this.shard(), "aggregator stopped");
        }))
    }

    async fn on_tick(&self, day: &Day) {
        if day.is_holiday {
            tracing::info!(shard = %self.shard(), time = %day.time, "holiday, skipping cutoff");
            return;
        }
        match self.run_cutoff(CutoffKind::Scheduled).await {
            Ok(summary) if summary.failures.is_empty() => {}
            Ok(summary) => tracing::error!(
                shard = %self.shard(),
                failures = ?summary.failures,
                "scheduled cutoff finished with failures"
            ),
            Err(error) => tracing::error!(shard = %self.shard(), error = %error, "scheduled cutoff failed"),
        }
    }

    /// Isolates, merges and delivers the shard's staged files.
    ///
    /// # Errors
    ///
    /// Returns an error when isolation or batch listing fails. Per-file
    /// failures are reported in the summary instead.
    #[tracing::instrument(skip(self), fields(shard = %self.shard()))]
    pub async fn run_cutoff(&self, kind: CutoffKind) -> Result<CutoffSummary> {
        let started = Instant::now();
        let shard_label = [(labels::SHARD, self.shard().as_str())];
        self.metrics.increment_counter(
            names::CUTOFFS_TOTAL,
            &[(labels::SHARD, self.shard().as_str()), (labels::TRIGGER, kind.as_str())],
            1,
        );

        let batch_dir = self.store.isolate().await?;
        let report = self
            .store
            .merge_and_deliver(&batch_dir, &ShardDelivery { aggregator: self })
            .await?;

        let uploaded = report.uploaded().count();
        let summary = CutoffSummary {
            batch_dir,
            merged_files: report.processed.len(),
            uploaded,
            skipped: report.processed.len() - uploaded,
            failures: report.failures,
        };

        self.emit(Event::CutoffCompleted(CutoffCompleted {
            shard: self.shard().clone(),
            trigger: kind.as_str().to_string(),
            merged_files: summary.merged_files,
            uploaded: summary.uploaded,
            skipped: summary.skipped,
            errors: summary.failures.len(),
            completed_at: Utc::now(),
        }))
        .await;

        self.metrics.record_histogram(
            names::CUTOFF_DURATION_SECONDS,
            &shard_label,
            started.elapsed().as_secs_f64(),
        );
        tracing::info!(
            trigger = kind.as_str(),
            merged_files = summary.merged_files,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failures = summary.failures.len(),
            "cutoff complete"
        );
        Ok(summary)
    }

    async fn emit(&self, event: Event) {
        let event_type = event.type_name();
        if let Err(error) = self.emitter.emit(event).await {
            tracing::warn!(shard = %self.shard(), event_type, error = %error, "failed to emit event");
        }
    }

    async fn notify(&self, file: &MergedFile, status: NotificationStatus) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        notifier
            .notify(&Notification {
                shard: self.shard().clone(),
                filename: file.filename.clone(),
                hostname: self.agent.hostname(),
                status,
                entries: file.control.entry_count,
                debit_total: file.control.total_debit,
                credit_total: file.control.total_credit,
            })
            .await;
    }
}

async fn next_tick(ticks: &mut Option<mpsc::Receiver<Day>>) -> Option<Day> {
    match ticks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Leader-gated delivery of one shard's merged files.
struct ShardDelivery<'a> {
    aggregator: &'a ShardAggregator,
}

#[async_trait]
impl Deliver for ShardDelivery<'_> {
    async fn deliver(&self, file: &MergedFile) -> Result<Delivery> {
        let agg = self.aggregator;
        let shard = agg.shard().as_str();
        let shard_label = [(labels::SHARD, shard)];

        if !agg.gate.acquire(shard).await {
            agg.metrics
                .increment_counter(names::LEADER_SKIPS_TOTAL, &shard_label, 1);
            tracing::info!(
                shard,
                filename = %file.filename,
                metric = names::LEADER_SKIPS_TOTAL,
                "not leader, skipping upload"
            );
            return Ok(Delivery::Skipped);
        }

        let outbound = OutboundFile {
            filename: file.filename.clone(),
            contents: file.contents.clone(),
        };
        if let Err(error) = agg.agent.upload_file(&outbound).await {
            agg.metrics
                .increment_counter(names::UPLOAD_ERRORS_TOTAL, &shard_label, 1);
            agg.notify(
                file,
                NotificationStatus::Failed {
                    error: error.to_string(),
                },
            )
            .await;
            return Err(error.into());
        }

        agg.metrics
            .increment_counter(names::FILES_UPLOADED_TOTAL, &shard_label, 1);
        tracing::info!(
            shard,
            shard_key = %file.shard_key,
            filename = %file.filename,
            files = file.file_ids.len(),
            metric = names::FILES_UPLOADED_TOTAL,
            "uploaded merged file"
        );

        let uploaded_at = Utc::now();
        for file_id in &file.file_ids {
            agg.emit(Event::FileUploaded(FileUploaded {
                file_id: file_id.clone(),
                shard_key: file.shard_key.clone(),
                uploaded_at,
                filename: file.filename.clone(),
            }))
            .await;
        }
        agg.notify(file, NotificationStatus::Succeeded).await;
        Ok(Delivery::Uploaded)
    }
}
