//! Wiring of a full pipeline from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use achgate_core::metrics::MetricsSink;
use achgate_core::transform::Transformer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::aggregator::ShardAggregator;
use crate::cleanup::CleanupService;
use crate::config::{OutboundConfig, UploadAgentConfig};
use crate::error::{Error, Result};
use crate::events::{EventEmitter, LoggingEmitter};
use crate::leader::LeaderGate;
use crate::leader::memory::InMemoryLeaderElector;
use crate::notify::LoggingNotifier;
use crate::receiver::{ChannelSubscription, FileReceiver, InMemoryShardMapper, Subscription};
use crate::store::TransferStore;
use crate::trigger::CutoffTrigger;
use crate::upload::UploadAgent;
use crate::upload::local::LocalDirAgent;
use crate::upload::memory::InMemoryAgent;
use crate::upload::retry::RetryAgent;

const LOCAL_SUBSCRIPTION: &str = "local";

/// A configured pipeline: one aggregator per shard, the intake receiver,
/// the cleanup service and the manual trigger.
#[derive(Debug)]
pub struct Pipeline {
    aggregators: Vec<Arc<ShardAggregator>>,
    receiver: Arc<FileReceiver>,
    cleanup: Option<Arc<CleanupService>>,
    trigger: CutoffTrigger,
    intake: mpsc::Sender<Vec<u8>>,
}

impl Pipeline {
    /// Builds every component described by `config`.
    ///
    /// Besides `subscriptions`, the receiver always listens on an in-process
    /// channel reachable through [`intake`](Self::intake).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(
        config: &OutboundConfig,
        subscriptions: Vec<Arc<dyn Subscription>>,
        metrics: &Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let root = config.storage.staging_root();
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());
        let elector = Arc::new(InMemoryLeaderElector::new(config.leader.lease_duration()));
        let gate = Arc::new(LeaderGate::new(elector, instance_id.clone()));
        let emitter: Arc<dyn EventEmitter> = Arc::new(LoggingEmitter);

        let agents: HashMap<&str, Arc<dyn UploadAgent>> = config
            .upload_agents
            .iter()
            .map(|agent| {
                let inner: Arc<dyn UploadAgent> = match agent {
                    UploadAgentConfig::Local { root, paths, .. } => {
                        Arc::new(LocalDirAgent::new(root.clone()).with_paths(paths.clone()))
                    }
                    UploadAgentConfig::Memory { .. } => Arc::new(InMemoryAgent::new()),
                };
                let wrapped: Arc<dyn UploadAgent> = Arc::new(RetryAgent::new(
                    inner,
                    config.upload.retry.clone(),
                    Arc::clone(metrics),
                ));
                (agent.id(), wrapped)
            })
            .collect();

        let mut aggregators = Vec::with_capacity(config.shards.len());
        for shard in &config.shards {
            let agent = agents.get(shard.upload_agent.as_str()).ok_or_else(|| {
                Error::config(format!("unknown upload agent {}", shard.upload_agent))
            })?;
            let store = TransferStore::new(
                root.clone(),
                shard.name.clone(),
                shard.merging.clone(),
                Arc::clone(metrics),
            );
            let mut aggregator =
                ShardAggregator::new(store, Arc::clone(&gate), Arc::clone(agent))
                    .with_scheduler(shard.cutoffs.scheduler()?)
                    .with_emitter(Arc::clone(&emitter))
                    .with_metrics(Arc::clone(metrics));
            if shard.notifications.enabled {
                aggregator = aggregator.with_notifier(Arc::new(LoggingNotifier));
            }
            aggregators.push(Arc::new(aggregator));
        }

        let (local, intake) =
            ChannelSubscription::new(LOCAL_SUBSCRIPTION, config.receiver.queue_capacity);
        let mut receiver = FileReceiver::new(
            aggregators.iter().cloned(),
            Arc::new(InMemoryShardMapper::new(config.shard_mappings.clone())),
        )
        .with_subscription(Arc::new(local))
        .with_transformer(Transformer::new(config.receiver.transform.encoding))
        .with_default_shard(config.default_shard.clone())
        .with_options(config.receiver.options())
        .with_metrics(Arc::clone(metrics));
        for subscription in subscriptions {
            receiver = receiver.with_subscription(subscription);
        }

        let cleanup = config.cleanup.enabled.then(|| {
            Arc::new(
                CleanupService::new(root.clone(), config.shard_names().cloned(), config.cleanup)
                    .with_metrics(Arc::clone(metrics)),
            )
        });

        tracing::info!(
            instance_id = %instance_id,
            root = %root.display(),
            shards = aggregators.len(),
            cleanup = cleanup.is_some(),
            "pipeline configured"
        );

        Ok(Self {
            trigger: CutoffTrigger::new(&aggregators),
            aggregators,
            receiver: Arc::new(receiver),
            cleanup,
            intake,
        })
    }

    /// Per-shard aggregators.
    #[must_use]
    pub fn aggregators(&self) -> &[Arc<ShardAggregator>] {
        &self.aggregators
    }

    /// Manual cutoff trigger for every shard.
    #[must_use]
    pub fn trigger(&self) -> &CutoffTrigger {
        &self.trigger
    }

    /// Cleanup service, when enabled.
    #[must_use]
    pub fn cleanup(&self) -> Option<&Arc<CleanupService>> {
        self.cleanup.as_ref()
    }

    /// Sender feeding the in-process intake subscription.
    #[must_use]
    pub fn intake(&self) -> mpsc::Sender<Vec<u8>> {
        self.intake.clone()
    }

    /// Starts aggregators, the receiver and cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if an aggregator was already started.
    pub fn start(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for aggregator in &self.aggregators {
            handles.push(aggregator.start(cancel.clone())?);
        }
        handles.push(self.receiver.start(cancel.clone()));
        if let Some(cleanup) = &self.cleanup {
            handles.push(cleanup.start(cancel.clone()));
        }
        Ok(handles)
    }
}
