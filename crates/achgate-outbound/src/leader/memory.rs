//! In-process leader elector.
//!
//! Suitable for tests and for running several aggregators inside one
//! process. It offers no coordination across processes.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{LeaderElector, LeadershipResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: String,
    expires_at: DateTime<Utc>,
}

/// Lease table guarded by an `RwLock`.
///
/// ```rust
/// use std::time::Duration;
/// use achgate_outbound::leader::memory::InMemoryLeaderElector;
///
/// let elector = InMemoryLeaderElector::new(Duration::from_secs(300));
/// # let _ = elector;
/// ```
#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Leadership {
        message: "lease table lock poisoned".into(),
    }
}

impl InMemoryLeaderElector {
    /// Creates an elector whose leases last `lease_duration`.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(lease) = leases.get_mut(lock_key) {
            if lease.expires_at > now && lease.holder != instance_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.holder.clone()),
                });
            }
            if lease.expires_at > now {
                lease.expires_at = self.expiry(now);
                return Ok(LeadershipResult::Acquired {
                    lease_token: lease.token.clone(),
                    lease_duration: self.lease_duration,
                });
            }
        }

        let lease = Lease {
            holder: instance_id.to_string(),
            token: Ulid::new().to_string(),
            expires_at: self.expiry(now),
        };
        let token = lease.token.clone();
        leases.insert(lock_key.to_string(), lease);
        drop(leases);

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let leases = self.leases.read().map_err(poison_err)?;
        let now = Utc::now();
        Ok(leases
            .get(lock_key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::leader::LeaderGate;

    #[tokio::test]
    async fn second_instance_is_refused() -> Result<()> {
        let elector = InMemoryLeaderElector::default();

        assert!(elector.try_acquire("testing", "node-1").await?.is_leader());
        match elector.try_acquire("testing", "node-2").await? {
            LeadershipResult::NotLeader { current_leader } => {
                assert_eq!(current_leader.as_deref(), Some("node-1"));
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn holder_reacquires_with_same_token() -> Result<()> {
        let elector = InMemoryLeaderElector::default();
        let first = elector.try_acquire("testing", "node-1").await?;
        let second = elector.try_acquire("testing", "node-1").await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn keys_are_independent() -> Result<()> {
        let elector = InMemoryLeaderElector::default();
        assert!(elector.try_acquire("shardA", "node-1").await?.is_leader());
        assert!(elector.try_acquire("shardB", "node-2").await?.is_leader());
        assert_eq!(elector.current_leader("shardB").await?.as_deref(), Some("node-2"));
        assert_eq!(elector.current_leader("shardC").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_millis(1));
        elector.try_acquire("testing", "node-1").await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(elector.try_acquire("testing", "node-2").await?.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn racing_gates_elect_exactly_one_leader() {
        let elector: Arc<dyn LeaderElector> = Arc::new(InMemoryLeaderElector::default());
        let a = Arc::new(LeaderGate::new(Arc::clone(&elector), "node-a"));
        let b = Arc::new(LeaderGate::new(Arc::clone(&elector), "node-b"));

        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let a = Arc::clone(&a);
                async move { a.acquire("shardA").await }
            }),
            tokio::spawn({
                let b = Arc::clone(&b);
                async move { b.acquire("shardA").await }
            }),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra ^ rb, "exactly one gate must win: a={ra} b={rb}");

        // Leadership sticks for the winner.
        let winner = if ra { a } else { b };
        assert!(winner.acquire("shardA").await);
    }
}
