//! Leader election for fleet-wide delivery coordination.
//!
//! Every replica merges every shard's batch, but only the leader for a shard
//! delivers. [`LeaderElector`] is the distributed lock backend (a session
//! based lock service in production, [`memory::InMemoryLeaderElector`] in
//! tests and single-process runs). [`LeaderGate`] wraps it with the
//! pipeline's rules:
//!
//! - **Sticky**: once acquired, leadership for a key is kept for the life of
//!   the process; the backend's own session keeps the lock alive.
//! - **Soft failure**: a backend error means "not leader", never a failed cycle.
//! - **Single instance**: a gate without a backend always reports leader.

pub mod memory;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// This instance holds the lock.
    Acquired {
        /// Token identifying the session that holds the lock.
        lease_token: String,
        /// How long the backend keeps the lock without renewal.
        lease_duration: Duration,
    },
    /// Another instance holds the lock.
    NotLeader {
        /// Identifier of the holder, if the backend reports it.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Distributed lock backend.
#[async_trait]
pub trait LeaderElector: Send + Sync + fmt::Debug {
    /// Attempts to take the lock named `lock_key` on behalf of `instance_id`.
    ///
    /// Acquiring a lock the instance already holds succeeds.
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult>;

    /// Returns the instance currently holding `lock_key`, if any.
    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}

/// Per-shard leadership gate consulted before every delivery.
#[derive(Debug)]
pub struct LeaderGate {
    elector: Option<Arc<dyn LeaderElector>>,
    instance_id: String,
    held: Mutex<HashSet<String>>,
}

impl LeaderGate {
    /// Creates a gate backed by `elector`.
    #[must_use]
    pub fn new(elector: Arc<dyn LeaderElector>, instance_id: impl Into<String>) -> Self {
        Self {
            elector: Some(elector),
            instance_id: instance_id.into(),
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Creates a gate for single-instance deployments; always leader.
    #[must_use]
    pub fn single_instance() -> Self {
        Self {
            elector: None,
            instance_id: String::new(),
            held: Mutex::new(HashSet::new()),
        }
    }

    /// The identifier this gate acquires locks under.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Returns whether this instance is leader for `key`.
    ///
    /// Backend failures are logged and reported as `false`.
    pub async fn acquire(&self, key: &str) -> bool {
        let Some(elector) = &self.elector else {
            return true;
        };

        if self.is_held(key) {
            return true;
        }

        match elector.try_acquire(key, &self.instance_id).await {
            Ok(LeadershipResult::Acquired { .. }) => {
                self.held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string());
                tracing::info!(lock_key = key, instance_id = %self.instance_id, "acquired leadership");
                true
            }
            Ok(LeadershipResult::NotLeader { current_leader }) => {
                tracing::debug!(
                    lock_key = key,
                    current_leader = current_leader.as_deref().unwrap_or("unknown"),
                    "not leader"
                );
                false
            }
            Err(error) => {
                tracing::warn!(lock_key = key, error = %error, "leadership acquisition failed, treating as not leader");
                false
            }
        }
    }

    fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl LeaderElector for Broken {
        async fn try_acquire(&self, _: &str, _: &str) -> Result<LeadershipResult> {
            Err(Error::Leadership {
                message: "session expired".into(),
            })
        }

        async fn current_leader(&self, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn single_instance_gate_is_always_leader() {
        let gate = LeaderGate::single_instance();
        assert!(gate.acquire("shardA").await);
        assert!(gate.acquire("shardB").await);
    }

    #[tokio::test]
    async fn racing_replicas_elect_exactly_one() {
        let elector = Arc::new(memory::InMemoryLeaderElector::default());
        let a = LeaderGate::new(elector.clone(), "replica-a");
        let b = LeaderGate::new(elector, "replica-b");

        let (won_a, won_b) = tokio::join!(a.acquire("shardA"), b.acquire("shardA"));
        assert!(won_a ^ won_b);

        // The winner keeps it, the loser keeps losing.
        assert_eq!(a.acquire("shardA").await, won_a);
        assert_eq!(b.acquire("shardA").await, won_b);
    }

    #[tokio::test]
    async fn backend_errors_mean_not_leader() {
        let gate = LeaderGate::new(Arc::new(Broken), "node-1");
        assert!(!gate.acquire("shardA").await);
    }

    #[test]
    fn leadership_result_is_leader() {
        let acquired = LeadershipResult::Acquired {
            lease_token: "t".into(),
            lease_duration: Duration::from_secs(1),
        };
        assert!(acquired.is_leader());
        assert!(!LeadershipResult::NotLeader { current_leader: None }.is_leader());
    }
}
