//! Retention behavior of the cleanup service.

use std::sync::Arc;

use achgate_core::ShardName;
use achgate_core::metrics::InMemoryMetrics;
use achgate_outbound::cleanup::{CleanupConfig, CleanupService};
use achgate_outbound::error::Result;
use achgate_outbound::metrics::names;
use achgate_test_utils::StagingRoot;
use chrono::{Duration, Utc};

const RETENTION_SECS: u64 = 3600;

fn service(staging: &StagingRoot, metrics: &Arc<InMemoryMetrics>) -> CleanupService {
    CleanupService::new(
        staging.path(),
        [ShardName::new("testing").unwrap()],
        CleanupConfig {
            enabled: true,
            interval_secs: 60,
            retention_secs: RETENTION_SECS,
        },
    )
    .with_metrics(metrics.clone())
}

#[tokio::test]
async fn sweep_deletes_only_expired_uploaded_batches() -> Result<()> {
    let staging = StagingRoot::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let now = Utc::now();

    let expired_uploaded = staging.make_batch("testing", now - Duration::hours(3), true);
    let expired_bare = staging.make_batch("testing", now - Duration::hours(2), false);
    let young_uploaded = staging.make_batch("testing", now - Duration::minutes(5), true);
    std::fs::create_dir_all(staging.path().join("testing/s1")).unwrap();

    let result = service(&staging, &metrics).sweep().await?;

    assert_eq!(result.deleted, 1);
    assert_eq!(result.missing_uploads, 1);
    assert_eq!(result.skipped_young, 1);
    assert!(!result.has_errors());

    assert!(!expired_uploaded.exists());
    assert!(expired_bare.exists());
    assert!(young_uploaded.exists());
    assert!(staging.path().join("testing/s1").exists());

    assert_eq!(metrics.counter_total(names::CLEANUP_DELETED_TOTAL), 1);
    assert_eq!(metrics.gauge(names::CLEANUP_MISSING_UPLOADS, &[]), Some(1.0));
    Ok(())
}

#[tokio::test]
async fn malformed_names_are_reported_without_aborting() -> Result<()> {
    let staging = StagingRoot::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let expired = staging.make_batch("testing", Utc::now() - Duration::days(2), true);
    std::fs::create_dir_all(staging.path().join("testing-yesterday/uploaded")).unwrap();
    std::fs::create_dir_all(staging.path().join("other-20200101-000000/uploaded")).unwrap();

    let result = service(&staging, &metrics).sweep().await?;

    assert_eq!(result.deleted, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("testing-yesterday"));
    assert!(!expired.exists());
    assert!(staging.path().join("testing-yesterday").exists());
    assert!(staging.path().join("other-20200101-000000").exists());
    assert_eq!(metrics.counter_total(names::CLEANUP_ERRORS_TOTAL), 1);
    Ok(())
}

#[tokio::test]
async fn plan_reports_without_deleting() -> Result<()> {
    let staging = StagingRoot::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let now = Utc::now();
    let expired = staging.make_batch("testing", now - Duration::hours(2), true);
    let bare = staging.make_batch("testing", now - Duration::hours(2) - Duration::seconds(1), false);
    staging.make_batch("testing", now, true);

    let report = service(&staging, &metrics).plan().await?;

    assert_eq!(report.to_delete, vec![expired.clone()]);
    assert_eq!(report.missing_uploads, vec![bare]);
    assert_eq!(report.young.len(), 1);
    assert!(report.malformed.is_empty());
    assert!(expired.exists());
    assert_eq!(metrics.counter_total(names::CLEANUP_DELETED_TOTAL), 0);
    Ok(())
}

#[tokio::test]
async fn missing_root_is_an_empty_sweep() -> Result<()> {
    let staging = StagingRoot::new();
    let service = CleanupService::new(
        staging.path().join("absent"),
        [ShardName::new("testing").unwrap()],
        CleanupConfig::default(),
    );
    let result = service.sweep().await?;
    assert_eq!(result.deleted + result.missing_uploads + result.skipped_young, 0);
    Ok(())
}
