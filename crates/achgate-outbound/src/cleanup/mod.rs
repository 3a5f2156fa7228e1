//! Cleanup of processed staging batches.
//!
//! Every cutoff leaves an isolated `<shard>-<timestamp>` directory behind,
//! holding its staged inputs and the merged files under `uploaded/`. The
//! cleanup service reclaims those directories once they are older than the
//! retention window and show upload evidence. Expired batches without any
//! uploaded output are left in place and only counted, so a failed batch is
//! never destroyed before someone has looked at it.
//!
//! ```rust,ignore
//! let service = CleanupService::new(root, shards, CleanupConfig::default());
//!
//! // Dry run first
//! let report = service.plan().await?;
//!
//! // Actually delete
//! let result = service.sweep().await?;
//! ```

mod collector;
mod policy;

pub use collector::{CleanupReport, CleanupResult, CleanupService};
pub use policy::CleanupConfig;
