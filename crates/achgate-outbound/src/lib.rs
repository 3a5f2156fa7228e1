//! # achgate-outbound
//!
//! The outbound ACH file pipeline.
//!
//! Producers publish ACH files (and cancellations) on intake subscriptions.
//! The pipeline stages each file durably under its shard, and at every
//! cutoff window merges the shard's staged files into bank-ready files and
//! delivers them through an upload agent.
//!
//! - **Receiver**: reveals, decodes and routes intake messages to shards
//! - **Aggregator**: one per shard; stages files and runs cutoff cycles
//! - **Scheduler**: turns `HH:MM` windows in a timezone into ticks
//! - **Store**: crash-safe staging with atomic isolation of each batch
//! - **Leader gate**: only one replica delivers a shard's files
//! - **Cleanup**: reclaims expired batches that were uploaded
//!
//! ## Guarantees
//!
//! - **Isolation is atomic**: a cutoff takes the whole staging directory in
//!   one rename; writes racing it land in the next batch
//! - **Cancellation wins**: a canceled file is never merged, whichever of
//!   the file and its cancel arrived first
//! - **Merges are deterministic**: the same staged files always produce the
//!   same merged output
//! - **Nothing unproven is deleted**: cleanup only removes batches with
//!   merged output under `uploaded/`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use achgate_core::merge::MergeOptions;
//! use achgate_core::metrics::noop;
//! use achgate_core::ShardName;
//! use achgate_outbound::aggregator::ShardAggregator;
//! use achgate_outbound::leader::LeaderGate;
//! use achgate_outbound::store::TransferStore;
//! use achgate_outbound::upload::memory::InMemoryAgent;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> achgate_outbound::error::Result<()> {
//! let store = TransferStore::new(
//!     "/var/lib/achgate/mergable",
//!     ShardName::new("testing")?,
//!     MergeOptions::default(),
//!     noop(),
//! );
//! let aggregator = Arc::new(ShardAggregator::new(
//!     store,
//!     Arc::new(LeaderGate::single_instance()),
//!     Arc::new(InMemoryAgent::new()),
//! ));
//!
//! let cancel = CancellationToken::new();
//! let handle = aggregator.start(cancel.clone())?;
//! let summary = aggregator.trigger_cutoff().await?;
//! println!("delivered {} merged file(s)", summary.uploaded);
//!
//! cancel.cancel();
//! # let _ = handle.await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregator;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod leader;
pub mod metrics;
pub mod notify;
pub mod receiver;
pub mod schedule;
pub mod service;
pub mod store;
pub mod trigger;
pub mod upload;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregator::{CutoffKind, CutoffSummary, ShardAggregator};
    pub use crate::cleanup::{CleanupConfig, CleanupService};
    pub use crate::config::OutboundConfig;
    pub use crate::error::{Error, Result};
    pub use crate::leader::{LeaderElector, LeaderGate};
    pub use crate::receiver::{FileReceiver, ShardMapper, Subscription};
    pub use crate::schedule::{CutoffScheduler, Day};
    pub use crate::service::Pipeline;
    pub use crate::store::TransferStore;
    pub use crate::trigger::CutoffTrigger;
    pub use crate::upload::{UploadAgent, UploadError};
}

pub use error::{Error, Result};
