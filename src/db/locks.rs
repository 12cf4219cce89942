//! In-process serialization of mutations that touch the same aggregate.
//!
//! Maintainers recompute derived columns from a snapshot of child rows, so two
//! concurrent writers on the same order (or restaurant) must not interleave.
//! A guard is taken before the database transaction begins and released after
//! it settles. Entries are reclaimed once the last holder or waiter is gone.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Aggregate whose derived state a mutation recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKey {
    Order(i32),
    Restaurant(i32),
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateKey::Order(id) => write!(f, "order:{}", id),
            AggregateKey::Restaurant(id) => write!(f, "restaurant:{}", id),
        }
    }
}

type LockMap = DashMap<AggregateKey, Arc<Mutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct AggregateLocks {
    inner: Arc<LockMap>,
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other task holds `key`.
    pub async fn acquire(&self, key: AggregateKey) -> AggregateGuard {
        // Clone out of the map before awaiting so no shard lock is held across the await.
        let mutex = self.inner.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        trace!(aggregate = %key, "Aggregate lock acquired");
        AggregateGuard {
            key,
            map: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of aggregates currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.len()
    }
}

/// Releases the aggregate on drop.
pub struct AggregateGuard {
    key: AggregateKey,
    map: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AggregateGuard {
    pub fn key(&self) -> AggregateKey {
        self.key
    }
}

impl fmt::Debug for AggregateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateGuard").field("key", &self.key).finish()
    }
}

impl Drop for AggregateGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left means no holder and no waiter.
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(aggregate = %self.key, "Aggregate lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = AggregateLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(AggregateKey::Order(1)).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = AggregateLocks::new();
        let _order = locks.acquire(AggregateKey::Order(7)).await;
        let restaurant = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire(AggregateKey::Restaurant(7)),
        )
        .await;
        assert!(restaurant.is_ok());
        assert_eq!(locks.tracked(), 2);
        drop(restaurant);
        assert_eq!(locks.tracked(), 1);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = AggregateLocks::new();
        let first = locks.acquire(AggregateKey::Order(3)).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(AggregateKey::Order(3)).await.key() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);

        assert_eq!(waiter.await.unwrap(), AggregateKey::Order(3));
        assert_eq!(locks.tracked(), 0);
    }
}
