//! Intake and lifecycle message envelope.
//!
//! Messages travel as a JSON object `{"type": "<TypeName>", "event": {...}}`.
//! The set of payloads is closed: [`Event`] enumerates every variant and
//! each variant carries its own discriminant string, so decoding is a
//! pattern match rather than a type registry lookup.
//!
//! # Example
//!
//! ```rust
//! use achgate_core::envelope::{self, CancelRequest, Event};
//! use achgate_core::id::{FileId, ShardKey};
//!
//! let event = Event::CancelRequest(CancelRequest {
//!     file_id: FileId::new("f1").unwrap(),
//!     shard_key: ShardKey::new("s1").unwrap(),
//! });
//! let bytes = envelope::encode(&event).unwrap();
//! assert!(String::from_utf8_lossy(&bytes).contains("\"type\":\"CancelRequest\""));
//! assert_eq!(envelope::decode(&bytes).unwrap(), event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ach::AchFile;
use crate::error::{Error, Result};
use crate::id::{FileId, ShardKey, ShardName};

/// A file submitted for the next cutoff of its shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingFile {
    /// Caller-assigned identifier; names the staged file.
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    /// Tenant routing key.
    #[serde(rename = "shardKey")]
    pub shard_key: ShardKey,
    /// The parsed batch file.
    pub file: AchFile,
}

impl IncomingFile {
    /// Checks that the payload carries at least one entry and is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the payload is empty or invalid.
    pub fn validate(&self) -> Result<()> {
        if self.file.is_empty() {
            return Err(Error::InvalidInput(format!(
                "incoming file {} has an empty payload",
                self.file_id
            )));
        }
        self.file.validate().map_err(|e| {
            Error::InvalidInput(format!("incoming file {}: {e}", self.file_id))
        })
    }
}

/// Request to void a previously (or subsequently) submitted file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CancelRequest {
    /// File being canceled.
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    /// Tenant routing key the file was submitted under.
    #[serde(rename = "shardKey")]
    pub shard_key: ShardKey,
}

/// Emitted once a merged file containing `file_id` has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploaded {
    /// File included in the delivered merged file.
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    /// Tenant routing key of the file.
    #[serde(rename = "shardKey")]
    pub shard_key: ShardKey,
    /// Delivery completion time.
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: DateTime<Utc>,
    /// Name of the delivered merged file.
    pub filename: String,
}

/// Emitted when a shard finishes a cutoff cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoffCompleted {
    /// Shard that ran the cutoff.
    pub shard: ShardName,
    /// `scheduled` or `manual`.
    pub trigger: String,
    /// Merged files produced.
    pub merged_files: usize,
    /// Merged files delivered by this instance.
    pub uploaded: usize,
    /// Merged files skipped because this instance was not leader.
    pub skipped: usize,
    /// Per-file failures.
    pub errors: usize,
    /// Cycle completion time.
    pub completed_at: DateTime<Utc>,
}

/// Closed set of messages carried by the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "event")]
pub enum Event {
    /// An incoming file.
    IncomingFile(IncomingFile),
    /// A cancel request.
    CancelRequest(CancelRequest),
    /// A delivery notice.
    FileUploaded(FileUploaded),
    /// A cutoff lifecycle notice.
    CutoffCompleted(CutoffCompleted),
}

impl Event {
    /// The discriminant written in the `type` field.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::IncomingFile(_) => "IncomingFile",
            Self::CancelRequest(_) => "CancelRequest",
            Self::FileUploaded(_) => "FileUploaded",
            Self::CutoffCompleted(_) => "CutoffCompleted",
        }
    }
}

/// Serializes an event into its JSON envelope.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if encoding fails.
pub fn encode(event: &Event) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(Error::serialization)
}

/// Parses a JSON envelope.
///
/// # Errors
///
/// Returns [`Error::Serialization`] for malformed JSON, an unknown `type`, or
/// a payload that does not match its declared type (including invalid IDs).
pub fn decode(bytes: &[u8]) -> Result<Event> {
    serde_json::from_slice(bytes).map_err(Error::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let event = Event::FileUploaded(FileUploaded {
            file_id: FileId::new("f1").unwrap(),
            shard_key: ShardKey::new("s1").unwrap(),
            uploaded_at: DateTime::parse_from_rfc3339("2024-03-04T16:15:00Z")
                .unwrap()
                .with_timezone(&Utc),
            filename: "abc.ach".into(),
        });
        let value: serde_json::Value = serde_json::from_slice(&encode(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "FileUploaded");
        assert_eq!(value["event"]["fileID"], "f1");
        assert_eq!(value["event"]["shardKey"], "s1");
        assert_eq!(value["event"]["filename"], "abc.ach");
        assert_eq!(event.type_name(), "FileUploaded");
    }

    #[test]
    fn rejects_unknown_types_and_bad_ids() {
        assert!(decode(br#"{"type":"Mystery","event":{}}"#).is_err());
        assert!(decode(br#"{"type":"CancelRequest","event":{"fileID":"","shardKey":"s1"}}"#).is_err());
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn cancel_request_decodes() {
        let event = decode(br#"{"type":"CancelRequest","event":{"fileID":"f1","shardKey":"s1"}}"#).unwrap();
        match event {
            Event::CancelRequest(cancel) => assert_eq!(cancel.file_id.as_str(), "f1"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
