//! Typed model of an ACH batch file.
//!
//! The NACHA fixed-width wire format is handled outside of achgate; inside the
//! pipeline a file travels as this typed model and is staged on disk in a
//! canonical JSON encoding. The encoding is deterministic (field order is fixed
//! by the struct definitions, no maps), so the same file always serializes to
//! the same bytes and therefore the same [`content_hash`].
//!
//! Control records are never stored; they are computed from the entries via
//! [`Batch::control`] and [`AchFile::control`].

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// File extension used for staged and merged files.
pub const FILE_EXTENSION: &str = "ach";

/// Modulus applied to entry hashes (the hash field is ten digits wide).
const ENTRY_HASH_MODULUS: u64 = 10_000_000_000;

/// Largest amount an entry can carry (the amount field is ten digits wide).
pub const MAX_ENTRY_AMOUNT: u64 = 9_999_999_999;

/// Records per block in the fixed-width format.
const BLOCKING_FACTOR: usize = 10;

/// An ACH file: one file header and its batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchFile {
    /// File header record.
    pub header: FileHeader,
    /// Batches in file order.
    pub batches: Vec<Batch>,
}

/// File header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    /// Routing number of the receiving point (usually the ODFI's bank).
    pub immediate_destination: String,
    /// Routing number or company ID of the sender.
    pub immediate_origin: String,
    /// Name of the receiving point.
    pub immediate_destination_name: String,
    /// Name of the sender.
    pub immediate_origin_name: String,
    /// Date the file was created.
    pub file_creation_date: NaiveDate,
    /// Time the file was created, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_creation_time: Option<NaiveTime>,
    /// Distinguishes multiple files created on the same date (`A`-`Z`, `0`-`9`).
    pub file_id_modifier: String,
}

/// A batch: header plus entry detail records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Batch header record.
    pub header: BatchHeader,
    /// Entry detail records.
    pub entries: Vec<EntryDetail>,
}

/// Batch header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHeader {
    /// `200` mixed, `220` credits only, `225` debits only.
    pub service_class_code: u16,
    /// Originating company name.
    pub company_name: String,
    /// Originating company identifier.
    pub company_identification: String,
    /// Standard entry class code (`PPD`, `CCD`, `WEB`, ...).
    pub standard_entry_class_code: String,
    /// Description shown to the receiver (`PAYROLL`, ...).
    pub company_entry_description: String,
    /// Requested settlement date.
    pub effective_entry_date: NaiveDate,
    /// First eight digits of the originating DFI's routing number.
    pub odfi_identification: String,
    /// Sequence number of the batch within its file.
    pub batch_number: u32,
}

/// Entry detail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDetail {
    /// Two-digit transaction code (`22` checking credit, `27` checking debit, ...).
    pub transaction_code: u8,
    /// First eight digits of the receiving DFI's routing number.
    pub rdfi_identification: String,
    /// Receiver's account number.
    pub dfi_account_number: String,
    /// Amount in cents.
    pub amount: u64,
    /// Receiver identification number.
    pub identification_number: String,
    /// Receiver name.
    pub individual_name: String,
    /// Fifteen-digit trace number, unique within a file.
    pub trace_number: String,
}

impl EntryDetail {
    /// Returns true for debit transaction codes (second digit 5-9).
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        self.transaction_code % 10 >= 5
    }
}

/// Computed batch control totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchControl {
    /// Number of entry records.
    pub entry_count: usize,
    /// Sum of RDFI routing prefixes, modulo 10^10.
    pub entry_hash: u64,
    /// Total debit amount in cents.
    pub total_debit: u64,
    /// Total credit amount in cents.
    pub total_credit: u64,
}

/// Computed file control totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileControl {
    /// Number of batches.
    pub batch_count: usize,
    /// Number of ten-record blocks in the fixed-width encoding.
    pub block_count: usize,
    /// Number of entry records across all batches.
    pub entry_count: usize,
    /// Sum of batch entry hashes, modulo 10^10.
    pub entry_hash: u64,
    /// Total debit amount in cents.
    pub total_debit: u64,
    /// Total credit amount in cents.
    pub total_credit: u64,
}

impl BatchHeader {
    /// Returns true when two headers describe the same batch, ignoring batch numbers.
    #[must_use]
    pub fn same_batch_as(&self, other: &Self) -> bool {
        self.service_class_code == other.service_class_code
            && self.company_name == other.company_name
            && self.company_identification == other.company_identification
            && self.standard_entry_class_code == other.standard_entry_class_code
            && self.company_entry_description == other.company_entry_description
            && self.effective_entry_date == other.effective_entry_date
            && self.odfi_identification == other.odfi_identification
    }
}

impl Batch {
    /// Computes the batch control record.
    #[must_use]
    pub fn control(&self) -> BatchControl {
        self.entries
            .iter()
            .fold(BatchControl::default(), |mut control, entry| {
                control.entry_count += 1;
                control.entry_hash =
                    (control.entry_hash + routing_prefix(&entry.rdfi_identification))
                        % ENTRY_HASH_MODULUS;
                if entry.is_debit() {
                    control.total_debit = control.total_debit.saturating_add(entry.amount);
                } else {
                    control.total_credit = control.total_credit.saturating_add(entry.amount);
                }
                control
            })
    }

    /// Number of fixed-width records this batch occupies (header, entries, control).
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.entries.len() + 2
    }

    /// Total amount moved by this batch (debits plus credits) in cents.
    #[must_use]
    pub fn total_amount(&self) -> u64 {
        self.entries
            .iter()
            .fold(0, |total, e| total.saturating_add(e.amount))
    }

    fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::InvalidInput(format!(
                "batch {} has no entries",
                self.header.batch_number
            )));
        }
        if !is_digits(&self.header.odfi_identification, 8) {
            return Err(Error::InvalidInput(format!(
                "batch {} ODFI identification must be 8 digits",
                self.header.batch_number
            )));
        }
        for entry in &self.entries {
            if entry.amount > MAX_ENTRY_AMOUNT {
                return Err(Error::InvalidInput(format!(
                    "entry {} amount {} exceeds {MAX_ENTRY_AMOUNT} cents",
                    entry.trace_number, entry.amount
                )));
            }
        }
        let control = self.control();
        match self.header.service_class_code {
            200 => {}
            220 if control.total_debit == 0 => {}
            225 if control.total_credit == 0 => {}
            220 | 225 => {
                return Err(Error::InvalidInput(format!(
                    "batch {} mixes debits and credits under service class {}",
                    self.header.batch_number, self.header.service_class_code
                )));
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "batch {} has unknown service class code {other}",
                    self.header.batch_number
                )));
            }
        }
        for entry in &self.entries {
            if !is_digits(&entry.rdfi_identification, 8) {
                return Err(Error::InvalidInput(format!(
                    "entry {} RDFI identification must be 8 digits",
                    entry.trace_number
                )));
            }
            if !is_digits(&entry.trace_number, 15) {
                return Err(Error::InvalidInput(format!(
                    "trace number '{}' must be 15 digits",
                    entry.trace_number
                )));
            }
        }
        Ok(())
    }
}

impl AchFile {
    /// Computes the file control record.
    #[must_use]
    pub fn control(&self) -> FileControl {
        let mut control = FileControl {
            batch_count: self.batches.len(),
            ..FileControl::default()
        };
        for batch in &self.batches {
            let batch_control = batch.control();
            control.entry_count += batch_control.entry_count;
            control.entry_hash = (control.entry_hash + batch_control.entry_hash) % ENTRY_HASH_MODULUS;
            control.total_debit = control.total_debit.saturating_add(batch_control.total_debit);
            control.total_credit = control.total_credit.saturating_add(batch_control.total_credit);
        }
        control.block_count = self.line_count().div_ceil(BLOCKING_FACTOR);
        control
    }

    /// Number of fixed-width records (file header, batches, file control).
    #[must_use]
    pub fn line_count(&self) -> usize {
        2 + self.batches.iter().map(Batch::line_count).sum::<usize>()
    }

    /// Total amount moved by this file (debits plus credits) in cents.
    #[must_use]
    pub fn total_amount(&self) -> u64 {
        self.batches
            .iter()
            .fold(0, |total, b| total.saturating_add(b.total_amount()))
    }

    /// Returns true if the file has no batches or only empty batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.entries.is_empty())
    }

    /// Checks structural rules: routing formats, trace numbers, service class codes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !is_digits(self.header.immediate_destination.trim_start(), 9) {
            return Err(Error::InvalidInput(
                "immediate destination must be a 9 digit routing number".into(),
            ));
        }
        if self.header.immediate_origin.trim().is_empty() {
            return Err(Error::InvalidInput("immediate origin is required".into()));
        }
        if self.batches.is_empty() {
            return Err(Error::InvalidInput("file has no batches".into()));
        }
        self.batches.iter().try_for_each(Batch::validate)
    }
}

/// Encodes a file into its canonical staged representation.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if encoding fails.
pub fn encode(file: &AchFile) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(file).map_err(Error::serialization)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes a staged file.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the bytes are not a valid encoded file.
pub fn decode(bytes: &[u8]) -> Result<AchFile> {
    serde_json::from_slice(bytes).map_err(Error::serialization)
}

/// SHA-256 of the encoded bytes, hex encoded. Used to name merged output files.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn routing_prefix(rdfi: &str) -> u64 {
    rdfi.get(..8).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn is_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: u8, amount: u64, trace: &str) -> EntryDetail {
        EntryDetail {
            transaction_code: code,
            rdfi_identification: "23138010".into(),
            dfi_account_number: "81967038518".into(),
            amount,
            identification_number: "#83738AB#".into(),
            individual_name: "Steven Tander".into(),
            trace_number: trace.into(),
        }
    }

    fn sample() -> AchFile {
        AchFile {
            header: FileHeader {
                immediate_destination: "231380104".into(),
                immediate_origin: "121042882".into(),
                immediate_destination_name: "Citadel".into(),
                immediate_origin_name: "Wells Fargo".into(),
                file_creation_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                file_creation_time: None,
                file_id_modifier: "A".into(),
            },
            batches: vec![Batch {
                header: BatchHeader {
                    service_class_code: 200,
                    company_name: "Wells Fargo".into(),
                    company_identification: "121042882".into(),
                    standard_entry_class_code: "PPD".into(),
                    company_entry_description: "PAYROLL".into(),
                    effective_entry_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
                    odfi_identification: "12104288".into(),
                    batch_number: 1,
                },
                entries: vec![
                    entry(22, 100_000, "121042880000001"),
                    entry(27, 2_500, "121042880000002"),
                ],
            }],
        }
    }

    #[test]
    fn control_totals() {
        let file = sample();
        let control = file.control();
        assert_eq!(control.entry_count, 2);
        assert_eq!(control.total_credit, 100_000);
        assert_eq!(control.total_debit, 2_500);
        assert_eq!(control.entry_hash, 2 * 23_138_010);
        assert_eq!(file.line_count(), 6);
        assert_eq!(control.block_count, 1);
    }

    #[test]
    fn validate_rejects_mixed_credit_only_batch() {
        let mut file = sample();
        file.batches[0].header.service_class_code = 220;
        assert!(file.validate().is_err());
        file.batches[0].entries.retain(|e| !e.is_debit());
        assert!(file.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_trace_numbers() {
        let mut file = sample();
        file.batches[0].entries[0].trace_number = "123".into();
        assert!(file.validate().is_err());
    }

    #[test]
    fn oversized_amounts_are_invalid_not_fatal() {
        let mut file = sample();
        file.batches[0].entries[0].amount = MAX_ENTRY_AMOUNT;
        assert!(file.validate().is_ok());

        for entry in &mut file.batches[0].entries {
            entry.transaction_code = 22;
            entry.amount = u64::MAX;
        }
        assert_eq!(file.control().total_credit, u64::MAX);
        assert_eq!(file.total_amount(), u64::MAX);
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let first = encode(&sample()).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(content_hash(&first), content_hash(&second));
        assert_eq!(content_hash(&first).len(), 64);
    }
}
