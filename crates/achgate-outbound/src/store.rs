//! Durable, filesystem-backed staging for one shard.
//!
//! Layout under the staging root:
//!
//! ```text
//! <root>/<shard>/<shardKey>/<fileID>.ach             staged, active
//! <root>/<shard>/<shardKey>/<fileID>.ach.canceled    canceled (or cancel marker)
//! <root>/<shard>-<YYYYMMDD-HHMMSS>/<shardKey>/...    isolated batch
//! <root>/<shard>-<YYYYMMDD-HHMMSS>/uploaded/<sha256>.ach
//! ```
//!
//! ## Invariants
//!
//! - Exactly one active directory per shard. [`TransferStore::isolate`]
//!   swaps it out with a single `rename`, so a concurrent write lands either
//!   in the isolated batch or in the fresh active directory.
//! - Writers create directories on demand and retry when the directory they
//!   resolved was renamed away underneath them.
//! - Staged writes go to a hidden temp file first and are renamed into place,
//!   so a merge never reads a half-written file.
//! - `<name>.canceled` suppresses the staged `<name>`, whichever of the two
//!   arrived first.
//! - Every directory in a batch other than `uploaded/` is a shard key. One
//!   that is not a valid key is a failure, so the batch is kept.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use achgate_core::ach::{self, AchFile, FILE_EXTENSION, FileControl};
use achgate_core::envelope::{CancelRequest, IncomingFile};
use achgate_core::merge::{MergeOptions, merge_files};
use achgate_core::metrics::MetricsSink;
use achgate_core::{FileId, ShardKey, ShardName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::metrics::{labels, names};

pub use achgate_core::id::{CANCELED_SUFFIX, UPLOADED_DIR};

/// Timestamp format embedded in isolated batch directory names.
pub const ISOLATION_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const WRITE_ATTEMPTS: usize = 3;

/// A merged output file written to `uploaded/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFile {
    /// `<sha256>.ach`.
    pub filename: String,
    /// Location inside the batch's `uploaded/` directory.
    pub path: PathBuf,
    /// Encoded bytes.
    pub contents: Vec<u8>,
    /// Tenant the inputs were staged under.
    pub shard_key: ShardKey,
    /// Input files contributing at least one entry.
    pub file_ids: Vec<FileId>,
    /// Control totals of the merged file.
    pub control: FileControl,
}

/// What the delivery callback did with a merged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to the remote.
    Uploaded,
    /// Not delivered because this instance is not leader.
    Skipped,
}

/// A merged file and its delivery outcome.
#[derive(Debug, Clone)]
pub struct Processed {
    /// The merged file.
    pub file: MergedFile,
    /// Outcome of the delivery callback.
    pub delivery: Delivery,
}

/// Outcome of [`TransferStore::merge_and_deliver`].
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Merged files that were delivered or skipped.
    pub processed: Vec<Processed>,
    /// One entry per input or output that failed.
    pub failures: Vec<String>,
    /// The batch held nothing to merge and was removed.
    pub batch_removed: bool,
}

impl MergeReport {
    /// Combined error listing every failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        if self.failures.is_empty() {
            None
        } else {
            Some(Error::PartialMerge {
                failures: self.failures.clone(),
            })
        }
    }

    /// Merged files delivered by this instance.
    pub fn uploaded(&self) -> impl Iterator<Item = &MergedFile> {
        self.processed
            .iter()
            .filter(|p| p.delivery == Delivery::Uploaded)
            .map(|p| &p.file)
    }
}

/// Delivery callback invoked once per merged file.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Delivers (or deliberately skips) `file`.
    async fn deliver(&self, file: &MergedFile) -> Result<Delivery>;
}

/// Staging area for one shard.
#[derive(Debug)]
pub struct TransferStore {
    root: PathBuf,
    shard: ShardName,
    merge_options: MergeOptions,
    metrics: Arc<dyn MetricsSink>,
    isolating: tokio::sync::Mutex<()>,
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Error {
    let context = context.into();
    move |source| achgate_core::Error::storage_with_source(context, source).into()
}

fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Core(core) if core.is_not_found())
}

fn staged_name(file_id: &FileId) -> String {
    format!("{file_id}.{FILE_EXTENSION}")
}

/// Directory name of a batch isolated at `at`.
#[must_use]
pub fn batch_dir_name(shard: &ShardName, at: DateTime<Utc>) -> String {
    format!("{shard}-{}", at.format(ISOLATION_TIMESTAMP_FORMAT))
}

impl TransferStore {
    /// Creates a store for `shard` under the staging `root`.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        shard: ShardName,
        merge_options: MergeOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            root: root.into(),
            shard,
            merge_options,
            metrics,
            isolating: tokio::sync::Mutex::new(()),
        }
    }

    /// The staging root shared by all shards.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The shard this store stages for.
    #[must_use]
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// The directory currently receiving writes.
    #[must_use]
    pub fn active_dir(&self) -> PathBuf {
        self.root.join(self.shard.as_str())
    }

    /// Stages an incoming file, overwriting any previous copy.
    ///
    /// A cancel marker for the same file wins: the write is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the filesystem rejects the write.
    pub async fn handle_transfer(&self, incoming: &IncomingFile) -> Result<()> {
        let bytes = ach::encode(&incoming.file)?;
        let written = self
            .with_active_dir(&incoming.shard_key, |dir| {
                let bytes = bytes.clone();
                let file_id = incoming.file_id.clone();
                async move { write_staged(&dir, &file_id, &bytes).await }
            })
            .await?;

        if written {
            self.metrics.increment_counter(
                names::FILES_STAGED_TOTAL,
                &[(labels::SHARD, self.shard.as_str())],
                1,
            );
            tracing::debug!(
                shard = %self.shard,
                shard_key = %incoming.shard_key,
                file_id = %incoming.file_id,
                "staged file"
            );
        } else {
            tracing::info!(
                shard = %self.shard,
                shard_key = %incoming.shard_key,
                file_id = %incoming.file_id,
                "file was canceled before it arrived, dropping"
            );
        }
        Ok(())
    }

    /// Cancels a staged file, or leaves a marker if it has not arrived yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem rejects the rename or marker write.
    pub async fn handle_cancel(&self, cancel: &CancelRequest) -> Result<()> {
        self.with_active_dir(&cancel.shard_key, |dir| {
            let file_id = cancel.file_id.clone();
            async move { cancel_staged(&dir, &file_id).await }
        })
        .await?;

        self.metrics.increment_counter(
            names::FILES_CANCELED_TOTAL,
            &[(labels::SHARD, self.shard.as_str())],
            1,
        );
        tracing::info!(
            shard = %self.shard,
            shard_key = %cancel.shard_key,
            file_id = %cancel.file_id,
            "canceled file"
        );
        Ok(())
    }

    /// Runs `op` against the active `<shardKey>` directory, recreating it and
    /// retrying when it disappears mid-operation.
    async fn with_active_dir<T, F, Fut>(&self, shard_key: &ShardKey, op: F) -> Result<T>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let dir = self.active_dir().join(shard_key.as_str());
        let mut attempt = 1;
        loop {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(io_error(format!("create {}", dir.display())))?;
            match op(dir.clone()).await {
                Err(error) if attempt < WRITE_ATTEMPTS && is_not_found(&error) => {
                    tracing::debug!(
                        shard = %self.shard,
                        shard_key = %shard_key,
                        attempt,
                        "active directory moved during write, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Freezes the active directory into a timestamped batch and starts a
    /// fresh active directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails. Failing to recreate the active
    /// directory is logged only; writers recreate it on demand.
    #[tracing::instrument(skip(self), fields(shard = %self.shard))]
    pub async fn isolate(&self) -> Result<PathBuf> {
        let _guard = self.isolating.lock().await;
        let active = self.active_dir();
        tokio::fs::create_dir_all(&active)
            .await
            .map_err(io_error(format!("create {}", active.display())))?;

        let mut at = Utc::now();
        let batch = loop {
            let candidate = self.root.join(batch_dir_name(&self.shard, at));
            let taken = tokio::fs::try_exists(&candidate)
                .await
                .map_err(io_error(format!("stat {}", candidate.display())))?;
            if !taken {
                break candidate;
            }
            at += chrono::Duration::seconds(1);
        };

        tokio::fs::rename(&active, &batch).await.map_err(io_error(format!(
            "isolate {} -> {}",
            active.display(),
            batch.display()
        )))?;

        if let Err(error) = tokio::fs::create_dir_all(&active).await {
            tracing::warn!(
                active = %active.display(),
                error = %error,
                "could not recreate active directory, writers will create it"
            );
        }

        tracing::info!(batch_dir = %batch.display(), "isolated staging directory");
        Ok(batch)
    }

    /// Merges every non-canceled staged file in `batch_dir`, writes each
    /// merged output to `uploaded/` and hands it to `deliver`.
    ///
    /// Failures on one file never stop its siblings; they are collected in
    /// the report. A batch with nothing to merge is removed.
    ///
    /// # Errors
    ///
    /// Returns an error only when `batch_dir` itself cannot be listed.
    #[tracing::instrument(skip_all, fields(shard = %self.shard, batch_dir = %batch_dir.display()))]
    pub async fn merge_and_deliver(
        &self,
        batch_dir: &Path,
        deliver: &dyn Deliver,
    ) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let mut produced = 0_usize;

        for key_dir in list_names(batch_dir, true).await? {
            if key_dir == UPLOADED_DIR {
                continue;
            }
            let shard_key = match ShardKey::new(key_dir.as_str()) {
                Ok(key) => key,
                Err(e) => {
                    report.failures.push(format!("{key_dir}: {e}"));
                    continue;
                }
            };

            let inputs = self
                .read_inputs(&batch_dir.join(&key_dir), &mut report.failures)
                .await;
            if inputs.is_empty() {
                continue;
            }

            let merged = self
                .merge_inputs(batch_dir, &shard_key, inputs, &mut report.failures)
                .await;
            produced += merged.len();

            for file in merged {
                match deliver.deliver(&file).await {
                    Ok(delivery) => report.processed.push(Processed { file, delivery }),
                    Err(e) => {
                        tracing::warn!(filename = %file.filename, error = %e, "delivery failed");
                        report.failures.push(format!("{}: {e}", file.filename));
                    }
                }
            }
        }

        if produced == 0 && report.failures.is_empty() {
            tokio::fs::remove_dir_all(batch_dir)
                .await
                .map_err(io_error(format!("remove {}", batch_dir.display())))?;
            report.batch_removed = true;
            tracing::info!("nothing to merge, removed batch directory");
        }

        if !report.failures.is_empty() {
            self.metrics.increment_counter(
                names::MERGE_ERRORS_TOTAL,
                &[(labels::SHARD, self.shard.as_str())],
                u64::try_from(report.failures.len()).unwrap_or(u64::MAX),
            );
        }
        Ok(report)
    }

    async fn read_inputs(&self, dir: &Path, failures: &mut Vec<String>) -> Vec<(FileId, AchFile)> {
        let names = match list_names(dir, false).await {
            Ok(names) => names,
            Err(e) => {
                failures.push(format!("{}: {e}", dir.display()));
                return Vec::new();
            }
        };

        let mut inputs = Vec::new();
        for name in mergeable(&names) {
            let path = dir.join(name);
            let Some(file_id) = name
                .strip_suffix(&format!(".{FILE_EXTENSION}"))
                .and_then(|id| FileId::new(id).ok())
            else {
                failures.push(format!("{}: not a staged file name", path.display()));
                continue;
            };
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(io_error(format!("read {}", path.display())))
                .and_then(|bytes| ach::decode(&bytes).map_err(Error::from));
            match parsed {
                Ok(file) => inputs.push((file_id, file)),
                Err(e) => {
                    tracing::warn!(shard = %self.shard, path = %path.display(), error = %e, "skipping unreadable staged file");
                    failures.push(format!("{}: {e}", path.display()));
                }
            }
        }
        inputs
    }

    async fn merge_inputs(
        &self,
        batch_dir: &Path,
        shard_key: &ShardKey,
        inputs: Vec<(FileId, AchFile)>,
        failures: &mut Vec<String>,
    ) -> Vec<MergedFile> {
        let traces: Vec<(FileId, (String, String), HashSet<String>)> = inputs
            .iter()
            .map(|(id, file)| {
                (
                    id.clone(),
                    origin_key(file),
                    file.batches
                        .iter()
                        .flat_map(|b| b.entries.iter().map(|e| e.trace_number.clone()))
                        .collect(),
                )
            })
            .collect();

        let files = inputs.into_iter().map(|(_, file)| file).collect();
        let uploaded = batch_dir.join(UPLOADED_DIR);
        let mut out = Vec::new();

        for merged in merge_files(files, &self.merge_options) {
            let key = origin_key(&merged);
            let file_ids = traces
                .iter()
                .filter(|(_, origin, set)| {
                    *origin == key
                        && merged
                            .batches
                            .iter()
                            .flat_map(|b| &b.entries)
                            .any(|e| set.contains(&e.trace_number))
                })
                .map(|(id, _, _)| id.clone())
                .collect();

            match write_merged(&uploaded, &merged).await {
                Ok((filename, path, contents)) => out.push(MergedFile {
                    filename,
                    path,
                    contents,
                    shard_key: shard_key.clone(),
                    file_ids,
                    control: merged.control(),
                }),
                Err(e) => failures.push(format!("{shard_key}: {e}")),
            }
        }
        out
    }

    /// Staged, non-canceled files in the active directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the active directory cannot be listed.
    pub async fn pending(&self) -> Result<Vec<(ShardKey, FileId)>> {
        let active = self.active_dir();
        if !tokio::fs::try_exists(&active)
            .await
            .map_err(io_error(format!("stat {}", active.display())))?
        {
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();
        for key_dir in list_names(&active, true).await? {
            let Ok(shard_key) = ShardKey::new(key_dir.as_str()) else {
                continue;
            };
            let names = list_names(&active.join(&key_dir), false).await?;
            for name in mergeable(&names) {
                if let Some(id) = name
                    .strip_suffix(&format!(".{FILE_EXTENSION}"))
                    .and_then(|id| FileId::new(id).ok())
                {
                    pending.push((shard_key.clone(), id));
                }
            }
        }
        Ok(pending)
    }
}

fn origin_key(file: &AchFile) -> (String, String) {
    (
        file.header.immediate_destination.clone(),
        file.header.immediate_origin.clone(),
    )
}

/// Staged names not suppressed by a cancel marker, sorted.
fn mergeable(names: &BTreeSet<String>) -> Vec<&str> {
    let extension = format!(".{FILE_EXTENSION}");
    let canceled: Vec<&str> = names
        .iter()
        .filter(|n| n.ends_with(CANCELED_SUFFIX))
        .map(String::as_str)
        .collect();
    names
        .iter()
        .filter(|n| !n.starts_with('.') && n.ends_with(&extension))
        .filter(|n| {
            !canceled
                .iter()
                .any(|c| c.strip_prefix(n.as_str()) == Some(CANCELED_SUFFIX))
        })
        .map(String::as_str)
        .collect()
}

async fn list_names(dir: &Path, dirs: bool) -> Result<BTreeSet<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(io_error(format!("list {}", dir.display())))?;
    let mut names = BTreeSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(io_error(format!("list {}", dir.display())))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(io_error(format!("stat {}", entry.path().display())))?;
        if file_type.is_dir() == dirs {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let target = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp-{}", Ulid::new()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(io_error(format!("write {}", tmp.display())))?;
    if let Err(source) = tokio::fs::rename(&tmp, &target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(format!("rename {}", target.display()))(source));
    }
    Ok(target)
}

/// Returns false when a cancel marker already exists.
async fn write_staged(dir: &Path, file_id: &FileId, bytes: &[u8]) -> Result<bool> {
    let name = staged_name(file_id);
    let marker = dir.join(format!("{name}{CANCELED_SUFFIX}"));
    if tokio::fs::try_exists(&marker)
        .await
        .map_err(io_error(format!("stat {}", marker.display())))?
    {
        return Ok(false);
    }
    write_atomic(dir, &name, bytes).await?;
    Ok(true)
}

async fn cancel_staged(dir: &Path, file_id: &FileId) -> Result<()> {
    let name = staged_name(file_id);
    let staged = dir.join(&name);
    let marker = dir.join(format!("{name}{CANCELED_SUFFIX}"));
    match tokio::fs::rename(&staged, &marker).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::write(&marker, b"")
            .await
            .map_err(io_error(format!("write {}", marker.display()))),
        Err(e) => Err(io_error(format!("cancel {}", staged.display()))(e)),
    }
}

async fn write_merged(uploaded: &Path, merged: &AchFile) -> Result<(String, PathBuf, Vec<u8>)> {
    let contents = ach::encode(merged)?;
    let filename = format!("{}.{FILE_EXTENSION}", ach::content_hash(&contents));
    tokio::fs::create_dir_all(uploaded)
        .await
        .map_err(io_error(format!("create {}", uploaded.display())))?;
    let path = write_atomic(uploaded, &filename, &contents).await?;
    Ok((filename, path, contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_markers_suppress_only_their_own_file() {
        let names: BTreeSet<String> = [
            "a.ach",
            "a.ach.canceled",
            "b.ach",
            "c.ach.canceled",
            ".d.ach.tmp-01H",
            "notes.txt",
            "e.ach",
            "e.ach.x.ach",
            "e.ach.x.ach.canceled",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(mergeable(&names), vec!["b.ach", "e.ach"]);
    }

    #[test]
    fn batch_dir_names_embed_utc_timestamp() {
        let at = DateTime::parse_from_rfc3339("2024-03-04T16:15:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let shard = ShardName::new("testing").unwrap();
        assert_eq!(batch_dir_name(&shard, at), "testing-20240304-161509");
    }

    #[test]
    fn report_error_combines_failures() {
        let report = MergeReport {
            failures: vec!["x".into(), "y".into()],
            ..MergeReport::default()
        };
        assert!(matches!(report.error(), Some(Error::PartialMerge { failures }) if failures.len() == 2));
        assert!(MergeReport::default().error().is_none());
    }
}
