//! Retry wrapper for upload agents.
//!
//! Transient failures are retried with Fibonacci backoff: the n-th retry
//! waits `interval * fib(n)` (1, 1, 2, 3, 5, ...). Everything else is
//! returned on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use achgate_core::metrics::MetricsSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AgentPaths, OutboundFile, UploadAgent, UploadError};
use crate::metrics::names;

/// Default substrings marking an uncategorized error as transient.
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "no such host",
    "temporary failure in name resolution",
];

/// Retry settings for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Base backoff interval in milliseconds.
    pub interval_millis: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Lowercase substrings that make an [`UploadError::Other`] transient.
    #[serde(default = "default_patterns")]
    pub transient_patterns: Vec<String>,
}

fn default_patterns() -> Vec<String> {
    DEFAULT_TRANSIENT_PATTERNS
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_millis: 1_000,
            max_retries: 5,
            transient_patterns: default_patterns(),
        }
    }
}

impl RetryConfig {
    /// Returns whether `error` should be retried.
    #[must_use]
    pub fn is_transient(&self, error: &UploadError) -> bool {
        match error {
            UploadError::Timeout(_) | UploadError::Dns(_) => true,
            UploadError::Other(message) => {
                let message = message.to_ascii_lowercase();
                self.transient_patterns
                    .iter()
                    .any(|pattern| message.contains(&pattern.to_ascii_lowercase()))
            }
        }
    }

    /// Backoff before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let (mut a, mut b) = (1_u64, 1_u64);
        for _ in 1..retry {
            (a, b) = (b, a.saturating_add(b));
        }
        Duration::from_millis(self.interval_millis.saturating_mul(a))
    }
}

/// Wraps an agent with retries. Without a config it is a passthrough.
#[derive(Debug)]
pub struct RetryAgent {
    inner: Arc<dyn UploadAgent>,
    config: Option<RetryConfig>,
    metrics: Arc<dyn MetricsSink>,
}

impl RetryAgent {
    /// Creates a wrapper around `inner`.
    #[must_use]
    pub fn new(
        inner: Arc<dyn UploadAgent>,
        config: Option<RetryConfig>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner,
            config,
            metrics,
        }
    }

    async fn run<'a, F, Fut>(&'a self, op: &'static str, mut call: F) -> Result<(), UploadError>
    where
        F: FnMut(&'a dyn UploadAgent) -> Fut,
        Fut: Future<Output = Result<(), UploadError>> + 'a,
    {
        let Some(config) = &self.config else {
            return call(self.inner.as_ref()).await;
        };

        let mut retry = 0_u32;
        loop {
            match call(self.inner.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(error) if retry < config.max_retries && config.is_transient(&error) => {
                    retry += 1;
                    let wait = config.backoff(retry);
                    tracing::warn!(
                        op,
                        retry,
                        max_retries = config.max_retries,
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        metric = names::UPLOAD_RETRIES_TOTAL,
                        "transient upload error, retrying"
                    );
                    self.metrics
                        .increment_counter(names::UPLOAD_RETRIES_TOTAL, &[], 1);
                    tokio::time::sleep(wait).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl UploadAgent for RetryAgent {
    async fn upload_file(&self, file: &OutboundFile) -> Result<(), UploadError> {
        self.run("upload", |agent| agent.upload_file(file)).await
    }

    async fn delete(&self, path: &str) -> Result<(), UploadError> {
        self.run("delete", |agent| agent.delete(path)).await
    }

    async fn ping(&self) -> Result<(), UploadError> {
        self.run("ping", |agent| agent.ping()).await
    }

    fn paths(&self) -> &AgentPaths {
        self.inner.paths()
    }

    fn hostname(&self) -> String {
        self.inner.hostname()
    }
}

#[cfg(test)]
mod tests {
    use achgate_core::metrics::{InMemoryMetrics, noop};

    use super::*;
    use crate::upload::memory::InMemoryAgent;

    fn file() -> OutboundFile {
        OutboundFile {
            filename: "x.ach".into(),
            contents: vec![1],
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            interval_millis: 1,
            max_retries,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn fibonacci_backoff() {
        let config = RetryConfig {
            interval_millis: 10,
            ..RetryConfig::default()
        };
        let waits: Vec<_> = (1..=6).map(|n| config.backoff(n).as_millis()).collect();
        assert_eq!(waits, vec![10, 10, 20, 30, 50, 80]);
    }

    #[test]
    fn transient_classification() {
        let config = RetryConfig::default();
        assert!(config.is_transient(&UploadError::Timeout("read".into())));
        assert!(config.is_transient(&UploadError::Dns("lookup".into())));
        assert!(config.is_transient(&UploadError::Other("dial tcp: lookup sftp: no such host".into())));
        assert!(config.is_transient(&UploadError::Other("i/o TIMEOUT".into())));
        assert!(!config.is_transient(&UploadError::Other("permission denied".into())));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let inner = Arc::new(InMemoryAgent::new());
        inner.fail_next(UploadError::Timeout("1".into()));
        inner.fail_next(UploadError::Dns("2".into()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let agent = RetryAgent::new(inner.clone(), Some(fast(3)), metrics.clone());

        agent.upload_file(&file()).await.unwrap();
        assert_eq!(inner.attempts(), 3);
        assert_eq!(inner.uploaded().len(), 1);
        assert_eq!(metrics.counter(names::UPLOAD_RETRIES_TOTAL, &[]), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(InMemoryAgent::new());
        for _ in 0..3 {
            inner.fail_next(UploadError::Timeout("slow".into()));
        }
        let agent = RetryAgent::new(inner.clone(), Some(fast(2)), noop());
        assert!(matches!(
            agent.upload_file(&file()).await,
            Err(UploadError::Timeout(_))
        ));
        assert_eq!(inner.attempts(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_surface_immediately() {
        let inner = Arc::new(InMemoryAgent::new());
        inner.fail_next(UploadError::Other("permission denied".into()));
        let agent = RetryAgent::new(inner.clone(), Some(fast(5)), noop());
        assert!(agent.upload_file(&file()).await.is_err());
        assert_eq!(inner.attempts(), 1);
    }

    #[tokio::test]
    async fn no_config_is_passthrough() {
        let inner = Arc::new(InMemoryAgent::new());
        inner.fail_next(UploadError::Timeout("once".into()));
        let agent = RetryAgent::new(inner.clone(), None, noop());
        assert!(agent.upload_file(&file()).await.is_err());
        agent.upload_file(&file()).await.unwrap();
        assert_eq!(inner.attempts(), 2);
        assert_eq!(agent.hostname(), "memory");
    }
}
