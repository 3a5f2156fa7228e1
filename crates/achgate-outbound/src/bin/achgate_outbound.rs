//! # achgate-outbound
//!
//! Outbound ACH pipeline service.
//!
//! ## Usage
//!
//! ```bash
//! # Run the pipeline until interrupted
//! achgate-outbound --config achgate.json serve
//!
//! # One manual cutoff on selected shards (all shards when none given)
//! achgate-outbound --config achgate.json cutoff --shard testing
//!
//! # One cleanup sweep, or report what it would delete
//! achgate-outbound --config achgate.json cleanup --dry-run
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::PathBuf;
use std::sync::Arc;

use achgate_core::ShardName;
use achgate_core::metrics::{FacadeMetrics, MetricsSink, noop};
use achgate_core::observability::{LogFormat, init_logging};
use achgate_outbound::cleanup::CleanupService;
use achgate_outbound::config::OutboundConfig;
use achgate_outbound::service::Pipeline;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound ACH pipeline.
#[derive(Debug, Parser)]
#[command(name = "achgate-outbound")]
#[command(about = "Stages, merges and delivers outbound ACH files")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "ACHGATE_CONFIG", global = true, default_value = "achgate.json")]
    config: PathBuf,

    /// Log output format (`json` or `pretty`); overrides the config file.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run intake, scheduled cutoffs and cleanup until interrupted.
    Serve,

    /// Run one manual cutoff and exit.
    Cutoff {
        /// Shard to cut off; repeat for several. Defaults to all shards.
        #[arg(long = "shard")]
        shards: Vec<String>,
    },

    /// Run one cleanup sweep and exit.
    Cleanup {
        /// Report what would be deleted without deleting.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = OutboundConfig::load(&args.config)?;
    config.apply_process_env()?;
    init_logging(args.log_format.unwrap_or(config.log_format));

    let metrics = install_metrics(config.metrics_port)?;

    match args.command {
        Commands::Serve => serve(&config, &metrics).await,
        Commands::Cutoff { shards } => cutoff(&config, &metrics, &shards).await,
        Commands::Cleanup { dry_run } => cleanup(&config, &metrics, dry_run).await,
    }
}

fn install_metrics(port: Option<u16>) -> Result<Arc<dyn MetricsSink>> {
    let Some(port) = port else {
        return Ok(noop());
    };
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("installing prometheus exporter")?;
    achgate_outbound::metrics::register_metrics();
    tracing::info!(port, "prometheus exporter listening");
    Ok(Arc::new(FacadeMetrics))
}

async fn serve(config: &OutboundConfig, metrics: &Arc<dyn MetricsSink>) -> Result<()> {
    let pipeline = Pipeline::build(config, Vec::new(), metrics)?;
    let cancel = CancellationToken::new();
    let handles = pipeline.start(&cancel)?;

    tracing::info!("achgate-outbound started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    cancel.cancel();
    join(handles).await;
    tracing::info!("achgate-outbound stopped");
    Ok(())
}

async fn cutoff(
    config: &OutboundConfig,
    metrics: &Arc<dyn MetricsSink>,
    shards: &[String],
) -> Result<()> {
    let names = shards
        .iter()
        .map(|name| ShardName::new(name.as_str()))
        .collect::<achgate_core::Result<Vec<_>>>()?;

    let pipeline = Pipeline::build(config, Vec::new(), metrics)?;
    let cancel = CancellationToken::new();
    let handles = pipeline.start(&cancel)?;

    let results = pipeline.trigger().trigger(&names).await;
    cancel.cancel();
    join(handles).await;

    let mut failed = 0usize;
    for outcome in &results {
        match &outcome.result {
            Ok(summary) => tracing::info!(
                shard = %outcome.shard,
                batch_dir = %summary.batch_dir.display(),
                merged_files = summary.merged_files,
                uploaded = summary.uploaded,
                skipped = summary.skipped,
                "cutoff completed"
            ),
            Err(error) => {
                failed += 1;
                tracing::error!(shard = %outcome.shard, error = %error, "cutoff failed");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} shard cutoffs failed", results.len());
    }
    Ok(())
}

async fn cleanup(
    config: &OutboundConfig,
    metrics: &Arc<dyn MetricsSink>,
    dry_run: bool,
) -> Result<()> {
    let service = CleanupService::new(
        config.storage.staging_root(),
        config.shard_names().cloned(),
        config.cleanup,
    )
    .with_metrics(Arc::clone(metrics));

    if dry_run {
        let report = service.plan().await?;
        for path in &report.to_delete {
            tracing::info!(batch_dir = %path.display(), "would delete");
        }
        for path in &report.missing_uploads {
            tracing::warn!(batch_dir = %path.display(), "expired without uploads");
        }
        tracing::info!(
            to_delete = report.to_delete.len(),
            young = report.young.len(),
            missing_uploads = report.missing_uploads.len(),
            malformed = report.malformed.len(),
            "cleanup dry run"
        );
        return Ok(());
    }

    let result = service.sweep().await?;
    if result.has_errors() {
        bail!("cleanup finished with errors: {}", result.errors.join("; "));
    }
    Ok(())
}

async fn join(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::error!(error = %error, "task panicked");
        }
    }
}
