//! Batch directory sweeper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use achgate_core::ShardName;
use achgate_core::metrics::{self as core_metrics, MetricsSink};
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupConfig;
use crate::error::Result;
use crate::metrics::names;
use crate::store::{ISOLATION_TIMESTAMP_FORMAT, UPLOADED_DIR};

/// Result of a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Batch directories deleted.
    pub deleted: u64,
    /// Batches still inside the retention window.
    pub skipped_young: u64,
    /// Expired batches left alone because nothing was uploaded.
    pub missing_uploads: u64,
    /// Errors encountered (the sweep continues past them).
    pub errors: Vec<String>,
}

impl CleanupResult {
    /// Merges another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.deleted += other.deleted;
        self.skipped_young += other.skipped_young;
        self.missing_uploads += other.missing_uploads;
        self.errors.extend(other.errors);
    }

    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Dry-run report showing what a sweep would do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Batches a sweep would delete.
    pub to_delete: Vec<PathBuf>,
    /// Expired batches without upload evidence.
    pub missing_uploads: Vec<PathBuf>,
    /// Batches still inside the retention window.
    pub young: Vec<PathBuf>,
    /// Directory names whose timestamp could not be parsed.
    pub malformed: Vec<String>,
}

#[derive(Debug)]
enum Verdict {
    Delete,
    Young,
    MissingUploads,
    Malformed(String),
}

#[derive(Debug)]
struct Candidate {
    name: String,
    path: PathBuf,
    verdict: Verdict,
}

/// Reclaims isolated batch directories that are expired and uploaded.
#[derive(Debug)]
pub struct CleanupService {
    root: PathBuf,
    shards: Vec<ShardName>,
    config: CleanupConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CleanupService {
    /// Creates a service sweeping batches of `shards` under the staging `root`.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        shards: impl IntoIterator<Item = ShardName>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            root: root.into(),
            shards: shards.into_iter().collect(),
            config,
            metrics: core_metrics::noop(),
        }
    }

    /// Records metrics on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Settings this service runs with.
    #[must_use]
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Reports what [`sweep`](Self::sweep) would delete, without deleting.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging root cannot be listed.
    pub async fn plan(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for candidate in self.scan(Utc::now()).await? {
            match candidate.verdict {
                Verdict::Delete => report.to_delete.push(candidate.path),
                Verdict::Young => report.young.push(candidate.path),
                Verdict::MissingUploads => report.missing_uploads.push(candidate.path),
                Verdict::Malformed(_) => report.malformed.push(candidate.name),
            }
        }
        Ok(report)
    }

    /// Deletes expired batches that carry upload evidence.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging root cannot be listed. Per-directory
    /// failures are collected in the result's `errors` field.
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn sweep(&self) -> Result<CleanupResult> {
        let start = Instant::now();
        let mut result = CleanupResult::default();

        let candidates = match self.scan(Utc::now()).await {
            Ok(candidates) => candidates,
            Err(error) => {
                self.metrics
                    .increment_counter(names::CLEANUP_ERRORS_TOTAL, &[], 1);
                return Err(error);
            }
        };

        for candidate in candidates {
            match candidate.verdict {
                Verdict::Young => result.skipped_young += 1,
                Verdict::MissingUploads => {
                    tracing::warn!(
                        batch_dir = %candidate.name,
                        "expired batch has no uploaded files, leaving it in place"
                    );
                    result.missing_uploads += 1;
                }
                Verdict::Malformed(error) => {
                    tracing::error!(
                        batch_dir = %candidate.name,
                        error = %error,
                        metric = names::CLEANUP_ERRORS_TOTAL,
                        "malformed batch directory name"
                    );
                    self.metrics
                        .increment_counter(names::CLEANUP_ERRORS_TOTAL, &[], 1);
                    result.errors.push(format!("{}: {error}", candidate.name));
                }
                Verdict::Delete => match tokio::fs::remove_dir_all(&candidate.path).await {
                    Ok(()) => {
                        tracing::info!(
                            batch_dir = %candidate.name,
                            metric = names::CLEANUP_DELETED_TOTAL,
                            "deleted batch directory"
                        );
                        self.metrics
                            .increment_counter(names::CLEANUP_DELETED_TOTAL, &[], 1);
                        result.deleted += 1;
                    }
                    Err(error) => {
                        tracing::error!(
                            batch_dir = %candidate.name,
                            error = %error,
                            metric = names::CLEANUP_ERRORS_TOTAL,
                            "failed to delete batch directory"
                        );
                        self.metrics
                            .increment_counter(names::CLEANUP_ERRORS_TOTAL, &[], 1);
                        result.errors.push(format!("{}: {error}", candidate.name));
                    }
                },
            }
        }

        self.metrics.set_gauge(
            names::CLEANUP_MISSING_UPLOADS,
            &[],
            f64::from(u32::try_from(result.missing_uploads).unwrap_or(u32::MAX)),
        );

        tracing::info!(
            deleted = result.deleted,
            skipped_young = result.skipped_young,
            missing_uploads = result.missing_uploads,
            errors_count = result.errors.len(),
            duration_secs = start.elapsed().as_secs_f64(),
            "cleanup sweep completed"
        );
        Ok(result)
    }

    /// Sweeps every configured interval until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let interval = this.config.interval();
            tracing::info!(interval_secs = interval.as_secs(), "cleanup service started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if let Err(error) = this.sweep().await {
                    tracing::error!(error = %error, "cleanup sweep failed");
                }
            }
            tracing::info!("cleanup service stopped");
        })
    }

    async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Candidate>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(achgate_core::Error::storage_with_source(
                    format!("listing {}", self.root.display()),
                    error,
                )
                .into());
            }
        };

        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or(chrono::Duration::MAX);
        let mut candidates = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    return Err(achgate_core::Error::storage_with_source(
                        format!("listing {}", self.root.display()),
                        error,
                    )
                    .into());
                }
            };
            let is_dir = entry.file_type().await.is_ok_and(|kind| kind.is_dir());
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_dir {
                continue;
            }
            let Some(parsed) = parse_batch_name(&name, &self.shards) else {
                continue;
            };
            let path = entry.path();
            let verdict = match parsed {
                Err(error) => Verdict::Malformed(error),
                Ok(isolated_at) if now - isolated_at < retention => Verdict::Young,
                Ok(_) if has_uploads(&path).await => Verdict::Delete,
                Ok(_) => Verdict::MissingUploads,
            };
            candidates.push(Candidate {
                name,
                path,
                verdict,
            });
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(candidates)
    }
}

/// Parses `<shard>-<timestamp>` for one of `shards`.
///
/// Returns `None` when the name belongs to no configured shard (including
/// the shards' own active directories) and `Some(Err)` when the timestamp
/// does not parse.
fn parse_batch_name(
    name: &str,
    shards: &[ShardName],
) -> Option<std::result::Result<DateTime<Utc>, String>> {
    if shards.iter().any(|shard| shard.as_str() == name) {
        return None;
    }
    let stamp = shards
        .iter()
        .filter_map(|shard| {
            name.strip_prefix(shard.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .map(|stamp| (shard.as_str().len(), stamp))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, stamp)| stamp)?;

    Some(
        NaiveDateTime::parse_from_str(stamp, ISOLATION_TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|error| format!("unparsable isolation timestamp {stamp:?}: {error}")),
    )
}

async fn has_uploads(batch: &Path) -> bool {
    match tokio::fs::read_dir(batch.join(UPLOADED_DIR)).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
