use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::AdError;

/// Acquisition parameters: the TTL after which a held lock is considered
/// abandoned, and how many times to retry before reporting contention.
/// Retries back off exponentially from 1 ms, capped at 5 ms.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retry_budget: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(100),
            retry_budget: 10,
        }
    }
}

/// Mutual exclusion across every writer sharing a key.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn obtain(&self, key: &str, opts: &LockOptions) -> Result<Box<dyn LockHandle>, AdError>;
}

/// A held lock. Dropping the handle without calling `release` leaves the
/// entry to expire at its TTL.
#[async_trait]
pub trait LockHandle: Send + std::fmt::Debug {
    async fn release(self: Box<Self>);
}

/// In-process lock table: token-fenced entries with TTL expiry. Serializes
/// writers within one process; a Redis-based implementation of the same
/// trait covers multi-replica deployments.
#[derive(Default)]
pub struct LocalLock {
    held: Arc<DashMap<String, Claim>>,
}

#[derive(Clone, Copy, Debug)]
struct Claim {
    token: Uuid,
    expires_at: Instant,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str, token: Uuid, ttl: Duration) -> bool {
        let claim = Claim {
            token,
            expires_at: Instant::now() + ttl,
        };
        match self.held.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(claim);
                true
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at <= Instant::now() {
                    slot.insert(claim);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn obtain(&self, key: &str, opts: &LockOptions) -> Result<Box<dyn LockHandle>, AdError> {
        let token = Uuid::new_v4();
        for attempt in 0..=opts.retry_budget {
            if attempt > 0 {
                let backoff = (1u64 << (attempt - 1).min(3)).min(5);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            if self.try_acquire(key, token, opts.ttl) {
                return Ok(Box::new(LocalHandle {
                    held: self.held.clone(),
                    key: key.to_string(),
                    token,
                }));
            }
        }
        Err(AdError::LockContention)
    }
}

#[derive(Debug)]
struct LocalHandle {
    held: Arc<DashMap<String, Claim>>,
    key: String,
    token: Uuid,
}

#[async_trait]
impl LockHandle for LocalHandle {
    async fn release(self: Box<Self>) {
        // Token fencing: never release a lock someone else re-acquired
        // after ours expired.
        self.held.remove_if(&self.key, |_, claim| claim.token == self.token);
    }
}
