//! Intake dispatcher.
//!
//! One task per [`Subscription`] receives messages and acknowledges them
//! immediately, then pushes the payload onto a bounded queue. A fixed pool
//! of workers drains the queue: each payload is revealed, decoded as an
//! envelope, validated, mapped to a shard and handed to that shard's
//! aggregator. Anything that fails along the way is logged, counted and
//! dropped; intake data-quality problems are never retried.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use achgate_core::envelope::{self, Event};
use achgate_core::metrics::{self as core_metrics, MetricsSink};
use achgate_core::transform::Transformer;
use achgate_core::{ShardKey, ShardName};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::aggregator::ShardAggregator;
use crate::error::{Error, Result};
use crate::metrics::{labels, names};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// A message pulled from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Identifier used to acknowledge the message.
    pub id: String,
    /// Concealed payload.
    pub payload: Vec<u8>,
}

/// An intake subscription.
#[async_trait]
pub trait Subscription: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Waits for the next message; `None` once the subscription is closed.
    async fn receive(&self) -> Result<Option<ReceivedMessage>>;

    /// Acknowledges a received message.
    async fn ack(&self, id: &str) -> Result<()>;
}

/// Subscription fed by an in-process channel.
#[derive(Debug)]
pub struct ChannelSubscription {
    name: String,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    acked: Mutex<Vec<String>>,
}

impl ChannelSubscription {
    /// Creates a subscription and the sender that publishes to it.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                rx: tokio::sync::Mutex::new(rx),
                acked: Mutex::new(Vec::new()),
            },
            tx,
        )
    }

    /// IDs acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>> {
        let payload = self.rx.lock().await.recv().await;
        Ok(payload.map(|payload| ReceivedMessage {
            id: Ulid::new().to_string(),
            payload,
        }))
    }

    async fn ack(&self, id: &str) -> Result<()> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string());
        Ok(())
    }
}

/// Resolves shard keys to shard names.
#[async_trait]
pub trait ShardMapper: Send + Sync + fmt::Debug {
    /// Looks up the shard owning `key`.
    async fn lookup(&self, key: &ShardKey) -> Result<Option<ShardName>>;
}

/// Static shard mapping.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShardMapper {
    mappings: HashMap<ShardKey, ShardName>,
}

impl InMemoryShardMapper {
    /// Creates a mapper from explicit pairs.
    #[must_use]
    pub fn new(mappings: HashMap<ShardKey, ShardName>) -> Self {
        Self { mappings }
    }

    /// Adds one mapping.
    #[must_use]
    pub fn with(mut self, key: ShardKey, shard: ShardName) -> Self {
        self.mappings.insert(key, shard);
        self
    }
}

#[async_trait]
impl ShardMapper for InMemoryShardMapper {
    async fn lookup(&self, key: &ShardKey) -> Result<Option<ShardName>> {
        Ok(self.mappings.get(key).cloned())
    }
}

/// Queue and worker sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Payloads buffered between subscriptions and workers.
    pub queue_capacity: usize,
    /// Concurrent dispatch workers.
    pub workers: usize,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            workers: 4,
        }
    }
}

/// Routes intake messages to shard aggregators.
#[derive(Debug)]
pub struct FileReceiver {
    subscriptions: Vec<Arc<dyn Subscription>>,
    transformer: Transformer,
    mapper: Arc<dyn ShardMapper>,
    aggregators: HashMap<ShardName, Arc<ShardAggregator>>,
    default_shard: Option<ShardName>,
    options: ReceiverOptions,
    metrics: Arc<dyn MetricsSink>,
}

impl FileReceiver {
    /// Creates a receiver routing to `aggregators`.
    #[must_use]
    pub fn new(
        aggregators: impl IntoIterator<Item = Arc<ShardAggregator>>,
        mapper: Arc<dyn ShardMapper>,
    ) -> Self {
        Self {
            subscriptions: Vec::new(),
            transformer: Transformer::default(),
            mapper,
            aggregators: aggregators
                .into_iter()
                .map(|agg| (agg.shard().clone(), agg))
                .collect(),
            default_shard: None,
            options: ReceiverOptions::default(),
            metrics: core_metrics::noop(),
        }
    }

    /// Adds an intake subscription.
    #[must_use]
    pub fn with_subscription(mut self, subscription: Arc<dyn Subscription>) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Sets how payloads are revealed.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    /// Routes to `shard` when the mapped shard has no aggregator.
    #[must_use]
    pub fn with_default_shard(mut self, shard: Option<ShardName>) -> Self {
        self.default_shard = shard;
        self
    }

    /// Sets queue and worker sizing.
    #[must_use]
    pub fn with_options(mut self, options: ReceiverOptions) -> Self {
        self.options = options;
        self
    }

    /// Records metrics on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts subscription readers and dispatch workers.
    ///
    /// The returned handle completes once cancellation has stopped the
    /// readers and the workers have drained the queue.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.options.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = Vec::new();
        for subscription in &self.subscriptions {
            tasks.push(tokio::spawn(read_subscription(
                Arc::clone(subscription),
                tx.clone(),
                cancel.clone(),
                Arc::clone(&self.metrics),
            )));
        }
        drop(tx);

        for worker in 0..self.options.workers.max(1) {
            let this = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(payload) = next else {
                        break;
                    };
                    if let Err(error) = this.dispatch(payload).await {
                        let reason = drop_reason(&error);
                        this.metrics.increment_counter(
                            names::INTAKE_DROPPED_TOTAL,
                            &[(labels::REASON, reason)],
                            1,
                        );
                        tracing::warn!(
                            worker,
                            reason,
                            error = %error,
                            metric = names::INTAKE_DROPPED_TOTAL,
                            "dropping intake message"
                        );
                    }
                }
                tracing::debug!(worker, "intake worker stopped");
            }));
        }

        tokio::spawn(async move {
            for task in tasks {
                if let Err(error) = task.await {
                    tracing::error!(error = %error, "intake task panicked");
                }
            }
        })
    }

    /// Reveals, decodes, validates and routes one payload.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload was not accepted.
    pub async fn dispatch(&self, payload: Vec<u8>) -> Result<()> {
        let revealed = self.transformer.reveal(payload)?;
        let event = envelope::decode(&revealed)?;
        self.metrics.increment_counter(
            names::FILES_RECEIVED_TOTAL,
            &[(labels::TYPE, event.type_name())],
            1,
        );

        match event {
            Event::IncomingFile(incoming) => {
                incoming.validate()?;
                let aggregator = self.route(&incoming.shard_key).await?;
                aggregator.accept_file(&incoming).await
            }
            Event::CancelRequest(cancel) => {
                let aggregator = self.route(&cancel.shard_key).await?;
                aggregator.cancel_file(&cancel).await
            }
            other => Err(Error::routing(format!(
                "unexpected {} message on intake",
                other.type_name()
            ))),
        }
    }

    async fn route(&self, key: &ShardKey) -> Result<Arc<ShardAggregator>> {
        let shard = self
            .mapper
            .lookup(key)
            .await?
            .ok_or_else(|| Error::routing(format!("no shard mapping for key {key}")))?;

        if let Some(aggregator) = self.aggregators.get(&shard) {
            return Ok(Arc::clone(aggregator));
        }
        match &self.default_shard {
            Some(default) => {
                tracing::debug!(shard_key = %key, shard = %shard, default = %default, "routing to default shard");
                self.aggregators
                    .get(default)
                    .cloned()
                    .ok_or_else(|| Error::ShardNotFound(default.clone()))
            }
            None => Err(Error::ShardNotFound(shard)),
        }
    }
}

async fn read_subscription(
    subscription: Arc<dyn Subscription>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) {
    let name = subscription.name().to_string();
    tracing::info!(subscription = %name, "intake subscription started");
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = subscription.receive() => received,
        };
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::info!(subscription = %name, "subscription closed");
                break;
            }
            Err(error) => {
                metrics.increment_counter(
                    names::INTAKE_DROPPED_TOTAL,
                    &[(labels::REASON, "receive")],
                    1,
                );
                tracing::warn!(subscription = %name, error = %error, "receive failed");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        if let Err(error) = subscription.ack(&message.id).await {
            tracing::warn!(subscription = %name, id = %message.id, error = %error, "ack failed");
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            sent = tx.send(message.payload) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!(subscription = %name, "intake subscription stopped");
}

fn drop_reason(error: &Error) -> &'static str {
    match error {
        Error::Core(achgate_core::Error::Serialization { .. }) => "decode",
        Error::Core(achgate_core::Error::InvalidInput(_) | achgate_core::Error::InvalidId { .. }) => {
            "invalid"
        }
        Error::Routing { .. } | Error::ShardNotFound(_) => "routing",
        _ => "staging",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_subscription_yields_and_acks() -> Result<()> {
        let (subscription, tx) = ChannelSubscription::new("test", 4);
        tx.send(b"hello".to_vec()).await.unwrap();
        drop(tx);

        let message = subscription.receive().await?.unwrap();
        assert_eq!(message.payload, b"hello");
        subscription.ack(&message.id).await?;
        assert_eq!(subscription.acked(), vec![message.id]);
        assert!(subscription.receive().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn mapper_lookup() -> Result<()> {
        let mapper = InMemoryShardMapper::default().with(
            ShardKey::new("s1").unwrap(),
            ShardName::new("testing").unwrap(),
        );
        assert_eq!(
            mapper.lookup(&ShardKey::new("s1").unwrap()).await?,
            Some(ShardName::new("testing").unwrap())
        );
        assert_eq!(mapper.lookup(&ShardKey::new("s2").unwrap()).await?, None);
        Ok(())
    }

    #[test]
    fn drop_reasons() {
        assert_eq!(
            drop_reason(&achgate_core::Error::serialization("bad").into()),
            "decode"
        );
        assert_eq!(
            drop_reason(&achgate_core::Error::InvalidInput("empty".into()).into()),
            "invalid"
        );
        assert_eq!(drop_reason(&Error::routing("nowhere")), "routing");
    }
}
