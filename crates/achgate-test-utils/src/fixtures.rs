//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create test data with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};

use achgate_core::ach::{AchFile, Batch, BatchHeader, EntryDetail, FileHeader};
use achgate_core::envelope::{self, CancelRequest, Event, IncomingFile};
use achgate_core::{FileId, ShardKey};
use chrono::{DateTime, NaiveDate, Utc};
use tempfile::TempDir;

/// Builds single-batch ACH files.
#[derive(Debug, Clone)]
pub struct FileBuilder {
    destination: String,
    origin: String,
    company: String,
    traces: Vec<String>,
    amount: u64,
    transaction_code: u8,
}

impl FileBuilder {
    /// A credit batch from origin `121042882` with no entries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            destination: "231380104".to_string(),
            origin: "121042882".to_string(),
            company: "Acme Payroll".to_string(),
            traces: Vec::new(),
            amount: 1_000,
            transaction_code: 22,
        }
    }

    /// Sets the immediate origin.
    #[must_use]
    pub fn origin(mut self, origin: &str) -> Self {
        self.origin = origin.to_string();
        self
    }

    /// Sets the immediate destination.
    #[must_use]
    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = destination.to_string();
        self
    }

    /// Sets the originating company name.
    #[must_use]
    pub fn company(mut self, company: &str) -> Self {
        self.company = company.to_string();
        self
    }

    /// Adds one entry per trace number.
    #[must_use]
    pub fn traces(mut self, traces: &[&str]) -> Self {
        self.traces.extend(traces.iter().map(ToString::to_string));
        self
    }

    /// Sets the amount of every entry, in cents.
    #[must_use]
    pub fn amount(mut self, cents: u64) -> Self {
        self.amount = cents;
        self
    }

    /// Makes every entry a checking debit.
    #[must_use]
    pub fn debits(mut self) -> Self {
        self.transaction_code = 27;
        self
    }

    /// Builds the file.
    pub fn build(&self) -> AchFile {
        let date = |day| NaiveDate::from_ymd_opt(2024, 3, day).expect("valid date");
        AchFile {
            header: FileHeader {
                immediate_destination: self.destination.clone(),
                immediate_origin: self.origin.clone(),
                immediate_destination_name: "Receiving Bank".to_string(),
                immediate_origin_name: "Originator".to_string(),
                file_creation_date: date(4),
                file_creation_time: None,
                file_id_modifier: "A".to_string(),
            },
            batches: vec![Batch {
                header: BatchHeader {
                    service_class_code: if self.transaction_code == 27 { 225 } else { 220 },
                    company_name: self.company.clone(),
                    company_identification: self.origin.clone(),
                    standard_entry_class_code: "PPD".to_string(),
                    company_entry_description: "PAYROLL".to_string(),
                    effective_entry_date: date(5),
                    odfi_identification: "12104288".to_string(),
                    batch_number: 1,
                },
                entries: self
                    .traces
                    .iter()
                    .map(|trace| EntryDetail {
                        transaction_code: self.transaction_code,
                        rdfi_identification: "23138010".to_string(),
                        dfi_account_number: "987654321".to_string(),
                        amount: self.amount,
                        identification_number: String::new(),
                        individual_name: "Jane Doe".to_string(),
                        trace_number: trace.clone(),
                    })
                    .collect(),
            }],
        }
    }
}

impl Default for FileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A file with one credit entry per trace number.
pub fn sample_file(traces: &[&str]) -> AchFile {
    FileBuilder::new().traces(traces).build()
}

/// An intake envelope carrying `file`.
pub fn incoming(file_id: &str, shard_key: &str, file: AchFile) -> IncomingFile {
    IncomingFile {
        file_id: FileId::new(file_id).expect("valid file id"),
        shard_key: ShardKey::new(shard_key).expect("valid shard key"),
        file,
    }
}

/// A cancel request.
pub fn cancel(file_id: &str, shard_key: &str) -> CancelRequest {
    CancelRequest {
        file_id: FileId::new(file_id).expect("valid file id"),
        shard_key: ShardKey::new(shard_key).expect("valid shard key"),
    }
}

/// Encoded `IncomingFile` envelope, as published on intake.
pub fn incoming_payload(file_id: &str, shard_key: &str, file: AchFile) -> Vec<u8> {
    envelope::encode(&Event::IncomingFile(incoming(file_id, shard_key, file)))
        .expect("encodable envelope")
}

/// Encoded `CancelRequest` envelope, as published on intake.
pub fn cancel_payload(file_id: &str, shard_key: &str) -> Vec<u8> {
    envelope::encode(&Event::CancelRequest(cancel(file_id, shard_key))).expect("encodable envelope")
}

/// A temporary staging tree, removed on drop.
#[derive(Debug)]
pub struct StagingRoot {
    dir: TempDir,
}

impl StagingRoot {
    /// Creates an empty staging root.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    /// Path of the staging root.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Staged file names under `<shard>/<shard_key>`, sorted.
    pub fn active_files(&self, shard: &str, shard_key: &str) -> Vec<String> {
        list(&self.path().join(shard).join(shard_key), false)
    }

    /// Directory names directly under the root, sorted.
    pub fn dirs(&self) -> Vec<String> {
        list(self.path(), true)
    }

    /// Batch directory names of `shard`, sorted.
    pub fn batch_dirs(&self, shard: &str) -> Vec<String> {
        let prefix = format!("{shard}-");
        self.dirs()
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect()
    }

    /// File names under `<batch>/uploaded`, sorted.
    pub fn uploaded(&self, batch: &str) -> Vec<String> {
        list(&self.path().join(batch).join("uploaded"), false)
    }

    /// Creates an isolated batch directory for `shard` stamped `at`, with
    /// one staged file and, when `uploaded`, one merged file.
    pub fn make_batch(&self, shard: &str, at: DateTime<Utc>, uploaded: bool) -> PathBuf {
        let batch = self
            .path()
            .join(format!("{shard}-{}", at.format("%Y%m%d-%H%M%S")));
        let staged = batch.join("s1");
        fs::create_dir_all(&staged).expect("create batch");
        fs::write(staged.join("f1.ach"), b"{}").expect("write staged file");
        if uploaded {
            let out = batch.join("uploaded");
            fs::create_dir_all(&out).expect("create uploaded dir");
            fs::write(out.join("merged.ach"), b"{}").expect("write merged file");
        }
        batch
    }
}

impl Default for StagingRoot {
    fn default() -> Self {
        Self::new()
    }
}

fn list(dir: &Path, dirs: bool) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir() == dirs))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}
