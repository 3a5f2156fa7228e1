//! # achgate-core
//!
//! Shared primitives for the achgate outbound ACH pipeline.
//!
//! - **Identifiers**: validated file IDs, shard keys and shard names
//! - **ACH model**: typed batch files, control totals and merge rules
//! - **Calendar**: Federal Reserve banking days
//! - **Envelope**: the closed set of intake and lifecycle messages
//! - **Transforms**: reveal/conceal of payloads in transit
//! - **Metrics**: the explicit metrics sink handed to every component
//!
//! ## Example
//!
//! ```rust
//! use achgate_core::prelude::*;
//!
//! let key = ShardKey::new("s1").unwrap();
//! let merged = merge_files(Vec::new(), &MergeOptions::default());
//! assert!(merged.is_empty());
//! # let _ = key;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod ach;
pub mod calendar;
pub mod envelope;
pub mod error;
pub mod id;
pub mod merge;
pub mod metrics;
pub mod observability;
pub mod transform;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::ach::{AchFile, Batch, BatchHeader, EntryDetail, FileHeader};
    pub use crate::envelope::{CancelRequest, CutoffCompleted, Event, FileUploaded, IncomingFile};
    pub use crate::error::{Error, Result};
    pub use crate::id::{FileId, ShardKey, ShardName};
    pub use crate::merge::{MergeOptions, merge_files};
    pub use crate::metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
}

pub use error::{Error, Result};
pub use id::{FileId, ShardKey, ShardName};
