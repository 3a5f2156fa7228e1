//! End-to-end tests: intake through cutoff to delivery.

use std::sync::Arc;
use std::time::Duration;

use achgate_core::metrics::InMemoryMetrics;
use achgate_core::merge::MergeOptions;
use achgate_core::transform::{Encoding, Transformer};
use achgate_core::{ShardKey, ShardName};
use achgate_outbound::aggregator::ShardAggregator;
use achgate_outbound::error::{Error, Result};
use achgate_outbound::events::InMemoryEmitter;
use achgate_outbound::leader::LeaderGate;
use achgate_outbound::leader::memory::InMemoryLeaderElector;
use achgate_outbound::metrics::{labels, names};
use achgate_outbound::notify::{NotificationStatus, RecordingNotifier};
use achgate_outbound::receiver::{
    ChannelSubscription, FileReceiver, InMemoryShardMapper, ReceiverOptions,
};
use achgate_outbound::schedule::{CutoffScheduler, Day};
use achgate_outbound::store::TransferStore;
use achgate_outbound::trigger::CutoffTrigger;
use achgate_outbound::upload::UploadError;
use achgate_outbound::upload::memory::InMemoryAgent;
use achgate_outbound::upload::retry::{RetryAgent, RetryConfig};
use achgate_test_utils::{
    FileBuilder, StagingRoot, cancel_payload, incoming_payload, init_test_logging, sample_file,
};
use chrono::TimeZone;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    staging: StagingRoot,
    agent: Arc<InMemoryAgent>,
    emitter: Arc<InMemoryEmitter>,
    notifier: Arc<RecordingNotifier>,
    metrics: Arc<InMemoryMetrics>,
    aggregator: Arc<ShardAggregator>,
}

fn shard(name: &str) -> ShardName {
    ShardName::new(name).unwrap()
}

fn key(name: &str) -> ShardKey {
    ShardKey::new(name).unwrap()
}

fn harness(shard_name: &str, gate: Arc<LeaderGate>) -> Harness {
    harness_with(shard_name, gate, InMemoryAgent::new(), None)
}

fn harness_with(
    shard_name: &str,
    gate: Arc<LeaderGate>,
    agent: InMemoryAgent,
    ticks: Option<mpsc::Receiver<Day>>,
) -> Harness {
    init_test_logging();
    let staging = StagingRoot::new();
    let agent = Arc::new(agent);
    let emitter = Arc::new(InMemoryEmitter::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let store = TransferStore::new(
        staging.path(),
        shard(shard_name),
        MergeOptions::default(),
        metrics.clone(),
    );
    let mut aggregator = ShardAggregator::new(store, gate, agent.clone())
        .with_emitter(emitter.clone())
        .with_notifier(notifier.clone())
        .with_metrics(metrics.clone());
    if let Some(ticks) = ticks {
        aggregator = aggregator.with_ticks(ticks);
    }
    let aggregator = Arc::new(aggregator);
    Harness {
        staging,
        agent,
        emitter,
        notifier,
        metrics,
        aggregator,
    }
}

fn receiver(h: &Harness) -> FileReceiver {
    FileReceiver::new(
        [h.aggregator.clone()],
        Arc::new(InMemoryShardMapper::default().with(key("s1"), shard("testing"))),
    )
    .with_metrics(h.metrics.clone())
}

#[tokio::test]
async fn staged_file_is_delivered_on_manual_cutoff() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));
    let receiver = receiver(&h);

    receiver
        .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
        .await?;
    assert_eq!(
        h.aggregator.store().pending().await?,
        vec![(key("s1"), achgate_core::FileId::new("f1")?)]
    );

    let cancel = CancellationToken::new();
    let handle = h.aggregator.start(cancel.clone())?;
    let trigger = CutoffTrigger::new([&h.aggregator]);
    let results = trigger.trigger(&[shard("testing")]).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(results.len(), 1);
    let summary = results[0].result.as_ref().unwrap();
    assert_eq!(summary.merged_files, 1);
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 0);

    let uploaded = h.emitter.file_uploaded();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].file_id.as_str(), "f1");
    assert_eq!(uploaded[0].shard_key, key("s1"));
    assert!(h.aggregator.store().pending().await?.is_empty());

    let delivered = h.agent.uploaded();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].filename, uploaded[0].filename);

    let batch = summary.batch_dir.file_name().unwrap().to_str().unwrap();
    assert_eq!(h.staging.uploaded(batch), vec![uploaded[0].filename.clone()]);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, NotificationStatus::Succeeded);
    assert_eq!(sent[0].entries, 1);

    assert_eq!(
        h.metrics
            .counter(names::FILES_RECEIVED_TOTAL, &[(labels::TYPE, "IncomingFile")]),
        1
    );
    assert_eq!(
        h.metrics.counter(
            names::CUTOFFS_TOTAL,
            &[(labels::SHARD, "testing"), (labels::TRIGGER, "manual")]
        ),
        1
    );
    Ok(())
}

#[tokio::test]
async fn canceled_file_is_never_delivered() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));
    let receiver = receiver(&h);

    receiver
        .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
        .await?;
    receiver
        .dispatch(incoming_payload("f2", "s1", sample_file(&["000000000000002"])))
        .await?;
    receiver.dispatch(cancel_payload("f1", "s1")).await?;

    let summary = h
        .aggregator
        .run_cutoff(achgate_outbound::aggregator::CutoffKind::Manual)
        .await?;
    assert_eq!(summary.uploaded, 1);

    let ids: Vec<String> = h
        .emitter
        .file_uploaded()
        .iter()
        .map(|u| u.file_id.to_string())
        .collect();
    assert_eq!(ids, vec!["f2".to_string()]);
    Ok(())
}

#[tokio::test]
async fn empty_cutoff_removes_its_batch() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));

    let summary = h
        .aggregator
        .run_cutoff(achgate_outbound::aggregator::CutoffKind::Scheduled)
        .await?;
    assert_eq!(summary.merged_files, 0);
    assert!(!summary.batch_dir.exists());
    assert!(h.staging.batch_dirs("testing").is_empty());
    assert!(h.agent.uploaded().is_empty());
    Ok(())
}

#[tokio::test]
async fn only_the_leader_delivers() -> Result<()> {
    let elector = Arc::new(InMemoryLeaderElector::default());
    let a = harness("testing", Arc::new(LeaderGate::new(elector.clone(), "replica-a")));
    let b = harness("testing", Arc::new(LeaderGate::new(elector, "replica-b")));

    for h in [&a, &b] {
        receiver(h)
            .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
            .await?;
    }

    let kind = achgate_outbound::aggregator::CutoffKind::Scheduled;
    let first = a.aggregator.run_cutoff(kind).await?;
    let second = b.aggregator.run_cutoff(kind).await?;

    assert_eq!((first.uploaded, first.skipped), (1, 0));
    assert_eq!((second.uploaded, second.skipped), (0, 1));
    assert_eq!(a.agent.uploaded().len(), 1);
    assert!(b.agent.uploaded().is_empty());
    assert!(b.emitter.file_uploaded().is_empty());
    assert_eq!(
        b.metrics
            .counter(names::LEADER_SKIPS_TOTAL, &[(labels::SHARD, "testing")]),
        1
    );

    // Leadership is kept for later cycles.
    receiver(&a)
        .dispatch(incoming_payload("f2", "s1", sample_file(&["000000000000002"])))
        .await?;
    assert_eq!(a.aggregator.run_cutoff(kind).await?.uploaded, 1);
    Ok(())
}

#[tokio::test]
async fn failed_upload_is_reported_and_batch_kept() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));
    receiver(&h)
        .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
        .await?;
    h.agent.fail_next(UploadError::other("permission denied"));

    let cancel = CancellationToken::new();
    let handle = h.aggregator.start(cancel.clone())?;
    let outcome = h.aggregator.trigger_cutoff().await;
    cancel.cancel();
    handle.await.unwrap();

    let Err(Error::PartialMerge { failures }) = outcome else {
        panic!("expected partial merge error, got {outcome:?}");
    };
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("permission denied"));

    assert!(h.emitter.file_uploaded().is_empty());
    assert!(matches!(
        h.notifier.sent()[0].status,
        NotificationStatus::Failed { .. }
    ));
    assert_eq!(h.staging.batch_dirs("testing").len(), 1);
    assert_eq!(
        h.metrics
            .counter(names::UPLOAD_ERRORS_TOTAL, &[(labels::SHARD, "testing")]),
        1
    );
    Ok(())
}

#[tokio::test]
async fn transient_upload_errors_are_retried() -> Result<()> {
    init_test_logging();
    let staging = StagingRoot::new();
    let inner = Arc::new(InMemoryAgent::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let agent = Arc::new(RetryAgent::new(
        inner.clone(),
        Some(RetryConfig {
            interval_millis: 1,
            max_retries: 3,
            ..RetryConfig::default()
        }),
        metrics.clone(),
    ));
    let store = TransferStore::new(
        staging.path(),
        shard("testing"),
        MergeOptions::default(),
        metrics.clone(),
    );
    let aggregator = ShardAggregator::new(store, Arc::new(LeaderGate::single_instance()), agent)
        .with_metrics(metrics.clone());

    aggregator
        .accept_file(&achgate_test_utils::incoming(
            "f1",
            "s1",
            sample_file(&["000000000000001"]),
        ))
        .await?;
    inner.fail_next(UploadError::Timeout("i/o timeout".into()));
    inner.fail_next(UploadError::other("dial tcp: lookup sftp: no such host"));

    let summary = aggregator
        .run_cutoff(achgate_outbound::aggregator::CutoffKind::Manual)
        .await?;
    assert_eq!(summary.uploaded, 1);
    assert_eq!(inner.attempts(), 3);
    assert_eq!(metrics.counter_total(names::UPLOAD_RETRIES_TOTAL), 2);
    Ok(())
}

#[tokio::test]
async fn receiver_routes_and_drops() -> Result<()> {
    let testing = harness("testing", Arc::new(LeaderGate::single_instance()));
    let metrics = testing.metrics.clone();
    let mapper = InMemoryShardMapper::default()
        .with(key("s1"), shard("testing"))
        .with(key("s2"), shard("elsewhere"));

    let strict = FileReceiver::new([testing.aggregator.clone()], Arc::new(mapper.clone()))
        .with_metrics(metrics.clone());
    assert!(matches!(
        strict
            .dispatch(incoming_payload("f2", "s2", sample_file(&["000000000000002"])))
            .await,
        Err(Error::ShardNotFound(_))
    ));
    assert!(matches!(
        strict
            .dispatch(incoming_payload("f3", "s3", sample_file(&["000000000000003"])))
            .await,
        Err(Error::Routing { .. })
    ));
    assert!(strict.dispatch(b"not json".to_vec()).await.is_err());
    assert!(
        strict
            .dispatch(incoming_payload("f4", "s1", FileBuilder::new().build()))
            .await
            .is_err()
    );

    let fallback = FileReceiver::new([testing.aggregator.clone()], Arc::new(mapper))
        .with_default_shard(Some(shard("testing")));
    fallback
        .dispatch(incoming_payload("f2", "s2", sample_file(&["000000000000002"])))
        .await?;
    assert_eq!(testing.staging.active_files("testing", "s2"), vec!["f2.ach"]);
    Ok(())
}

#[tokio::test]
async fn subscriptions_feed_workers_until_cancelled() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));
    let transformer = Transformer::new(Encoding::Base64);
    let (subscription, publisher) = ChannelSubscription::new("test", 8);
    let subscription = Arc::new(subscription);

    let receiver = Arc::new(
        receiver(&h)
            .with_subscription(subscription.clone())
            .with_transformer(transformer.clone())
            .with_options(ReceiverOptions {
                queue_capacity: 2,
                workers: 2,
            }),
    );
    let cancel = CancellationToken::new();
    let handle = receiver.start(cancel.clone());

    for (id, trace) in [("f1", "000000000000001"), ("f2", "000000000000002")] {
        let payload = transformer.conceal(incoming_payload(id, "s1", sample_file(&[trace])))?;
        publisher.send(payload).await.unwrap();
    }
    publisher.send(b"%%% not base64".to_vec()).await.unwrap();

    let staged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pending = h.aggregator.store().pending().await.unwrap();
            if pending.len() == 2 {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("files staged");
    assert_eq!(staged.len(), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.metrics.counter_total(names::INTAKE_DROPPED_TOTAL) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bad payload dropped");
    assert_eq!(
        h.metrics
            .counter(names::INTAKE_DROPPED_TOTAL, &[(labels::REASON, "decode")]),
        1
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("receiver stopped")
        .unwrap();
    assert_eq!(subscription.acked().len(), 3);
    Ok(())
}

#[tokio::test]
async fn oversized_amounts_are_dropped_and_intake_continues() -> Result<()> {
    let h = harness("testing", Arc::new(LeaderGate::single_instance()));
    let (subscription, publisher) = ChannelSubscription::new("test", 8);
    let receiver = Arc::new(
        receiver(&h)
            .with_subscription(Arc::new(subscription))
            .with_options(ReceiverOptions {
                queue_capacity: 4,
                workers: 1,
            }),
    );
    let cancel = CancellationToken::new();
    let handle = receiver.start(cancel.clone());

    let oversized = FileBuilder::new()
        .traces(&["000000000000001", "000000000000002"])
        .amount(u64::MAX)
        .build();
    publisher
        .send(incoming_payload("f1", "s1", oversized))
        .await
        .unwrap();
    publisher
        .send(incoming_payload("f2", "s1", sample_file(&["000000000000003"])))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.aggregator.store().pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second file staged by the same worker");

    assert_eq!(
        h.aggregator.store().pending().await?,
        vec![(key("s1"), achgate_core::FileId::new("f2")?)]
    );
    assert_eq!(
        h.metrics
            .counter(names::INTAKE_DROPPED_TOTAL, &[(labels::REASON, "invalid")]),
        1
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("receiver stopped")
        .unwrap();
    Ok(())
}

fn tick(year: i32, month: u32, day: u32) -> Day {
    let scheduler = CutoffScheduler::new("America/New_York", &["16:15".to_string()]).unwrap();
    let time = chrono_tz::America::New_York
        .with_ymd_and_hms(year, month, day, 16, 15, 0)
        .unwrap();
    scheduler.classify(time, true)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached");
}

#[tokio::test]
async fn scheduled_ticks_run_cutoffs_except_on_holidays() -> Result<()> {
    let (tx, rx) = mpsc::channel(4);
    let h = harness_with(
        "testing",
        Arc::new(LeaderGate::single_instance()),
        InMemoryAgent::new(),
        Some(rx),
    );
    let cancel = CancellationToken::new();
    let handle = h.aggregator.start(cancel.clone())?;

    receiver(&h)
        .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
        .await?;

    let independence_day = tick(2024, 7, 4);
    assert!(independence_day.is_holiday);
    tx.send(independence_day).await.unwrap();
    let tuesday = tick(2024, 3, 5);
    assert!(tuesday.is_banking_day);
    tx.send(tuesday).await.unwrap();

    let emitter = h.emitter.clone();
    wait_for(move || !emitter.file_uploaded().is_empty()).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(h.agent.uploaded().len(), 1);
    assert_eq!(h.emitter.file_uploaded()[0].file_id.as_str(), "f1");
    assert_eq!(
        h.metrics.counter(
            names::CUTOFFS_TOTAL,
            &[(labels::SHARD, "testing"), (labels::TRIGGER, "scheduled")]
        ),
        1
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_lets_the_running_cutoff_finish() -> Result<()> {
    let (tx, rx) = mpsc::channel(4);
    let h = harness_with(
        "testing",
        Arc::new(LeaderGate::single_instance()),
        InMemoryAgent::new().with_latency(Duration::from_millis(500)),
        Some(rx),
    );
    let cancel = CancellationToken::new();
    let handle = h.aggregator.start(cancel.clone())?;

    receiver(&h)
        .dispatch(incoming_payload("f1", "s1", sample_file(&["000000000000001"])))
        .await?;
    tx.send(tick(2024, 3, 5)).await.unwrap();

    let agent = h.agent.clone();
    wait_for(move || agent.attempts() == 1).await;
    assert!(h.emitter.file_uploaded().is_empty());
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("aggregator stopped")
        .unwrap();
    assert_eq!(h.agent.uploaded().len(), 1);
    assert_eq!(h.emitter.file_uploaded().len(), 1);
    assert!(h.aggregator.store().pending().await?.is_empty());
    Ok(())
}
