//! Manual cutoff trigger.
//!
//! Shares each aggregator's serialized control loop with the scheduler, so a
//! manual trigger queued while a scheduled cutoff runs simply waits its turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use achgate_core::ShardName;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};

use crate::aggregator::{CutoffSummary, ManualCutoff, ShardAggregator};
use crate::error::{Error, Result};

/// Outcome of a manual cutoff for one shard.
#[derive(Debug)]
pub struct ShardCutoffResult {
    /// Shard the result belongs to.
    pub shard: ShardName,
    /// The cycle's outcome.
    pub result: Result<CutoffSummary>,
}

/// Fans manual cutoffs out to aggregators.
#[derive(Debug, Clone, Default)]
pub struct CutoffTrigger {
    shards: BTreeMap<ShardName, mpsc::Sender<ManualCutoff>>,
}

impl CutoffTrigger {
    /// Creates a trigger for the given aggregators.
    #[must_use]
    pub fn new<'a>(aggregators: impl IntoIterator<Item = &'a Arc<ShardAggregator>>) -> Self {
        Self {
            shards: aggregators
                .into_iter()
                .map(|agg| (agg.shard().clone(), agg.manual_trigger()))
                .collect(),
        }
    }

    /// Registered shard names.
    pub fn shards(&self) -> impl Iterator<Item = &ShardName> {
        self.shards.keys()
    }

    /// Runs a cutoff on each named shard (all shards when `names` is empty)
    /// and waits for every one to finish.
    pub async fn trigger(&self, names: &[ShardName]) -> Vec<ShardCutoffResult> {
        let selected: Vec<ShardName> = if names.is_empty() {
            self.shards.keys().cloned().collect()
        } else {
            names.to_vec()
        };

        join_all(selected.into_iter().map(|shard| async move {
            let result = match self.shards.get(&shard) {
                Some(tx) => request(tx).await,
                None => Err(Error::ShardNotFound(shard.clone())),
            };
            if let Err(error) = &result {
                tracing::warn!(shard = %shard, error = %error, "manual cutoff failed");
            }
            ShardCutoffResult { shard, result }
        }))
        .await
    }
}

pub(crate) async fn request(tx: &mpsc::Sender<ManualCutoff>) -> Result<CutoffSummary> {
    let (respond, outcome) = oneshot::channel();
    tx.send(ManualCutoff { respond })
        .await
        .map_err(|_| Error::ChannelClosed("manual cutoff queue"))?;
    outcome
        .await
        .map_err(|_| Error::ChannelClosed("manual cutoff response"))?
}
