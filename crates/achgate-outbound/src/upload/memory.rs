//! Upload agent that keeps deliveries in memory.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentPaths, OutboundFile, UploadAgent, UploadError};

#[derive(Debug, Default)]
struct State {
    uploaded: Vec<OutboundFile>,
    deleted: Vec<String>,
    failures: VecDeque<UploadError>,
    attempts: usize,
}

/// Records every upload; failures queued with [`InMemoryAgent::fail_next`]
/// are returned by the next calls, one per call.
#[derive(Debug, Default)]
pub struct InMemoryAgent {
    paths: AgentPaths,
    latency: Duration,
    state: Mutex<State>,
}

impl InMemoryAgent {
    /// Creates an agent with default paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every successful upload take `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Queues a failure for the next upload, delete or ping.
    pub fn fail_next(&self, error: UploadError) {
        self.with(|s| s.failures.push_back(error));
    }

    /// Files delivered so far, in order.
    #[must_use]
    pub fn uploaded(&self) -> Vec<OutboundFile> {
        self.with(|s| s.uploaded.clone())
    }

    /// Paths deleted so far.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.with(|s| s.deleted.clone())
    }

    /// Upload calls made, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.with(|s| s.attempts)
    }
}

#[async_trait]
impl UploadAgent for InMemoryAgent {
    async fn upload_file(&self, file: &OutboundFile) -> Result<(), UploadError> {
        let failure = self.with(|s| {
            s.attempts += 1;
            s.failures.pop_front()
        });
        if let Some(error) = failure {
            return Err(error);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.with(|s| s.uploaded.push(file.clone()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), UploadError> {
        self.with(|s| {
            if let Some(error) = s.failures.pop_front() {
                return Err(error);
            }
            s.deleted.push(path.to_string());
            Ok(())
        })
    }

    async fn ping(&self) -> Result<(), UploadError> {
        self.with(|s| s.failures.pop_front().map_or(Ok(()), Err))
    }

    fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    fn hostname(&self) -> String {
        "memory".into()
    }
}
