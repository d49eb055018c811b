//! Per-proxy concurrency slots
//!
//! Each proxy gets a semaphore sized to the per-proxy worker limit. A slot is
//! held for the duration of one HTTP attempt and released on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// RAII guard for one slot
///
/// Dropping it returns the permit to the proxy's semaphore.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

/// Semaphores keyed by proxy key
#[derive(Debug)]
pub struct ProxySlots {
    per_proxy: usize,
    semaphores: DashMap<String, Arc<Semaphore>>,
    acquisitions: DashMap<String, AtomicU64>,
}

impl ProxySlots {
    pub fn new(per_proxy: usize) -> Self {
        Self {
            per_proxy: per_proxy.max(1),
            semaphores: DashMap::new(),
            acquisitions: DashMap::new(),
        }
    }

    pub fn per_proxy(&self) -> usize {
        self.per_proxy
    }

    /// Wait up to `wait` for a slot on `key`
    ///
    /// Returns `None` when the wait expires; the caller treats that as a
    /// transient failure of the attempt.
    pub async fn acquire(&self, key: &str, wait: Duration) -> Option<SlotGuard> {
        let semaphore = self
            .semaphores
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_proxy)))
            .clone();

        let permit = match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return None,
        };

        self.acquisitions
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        Some(SlotGuard { _permit: permit })
    }

    /// Total successful acquisitions for `key`
    pub fn acquisitions(&self, key: &str) -> u64 {
        self.acquisitions
            .get(key)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Slots currently held on `key`
    pub fn in_flight(&self, key: &str) -> usize {
        self.semaphores
            .get(key)
            .map(|sem| self.per_proxy.saturating_sub(sem.available_permits()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let slots = ProxySlots::new(2);
        let a = slots.acquire("p1", Duration::from_millis(10)).await.unwrap();
        let _b = slots.acquire("p1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(slots.in_flight("p1"), 2);

        drop(a);
        assert_eq!(slots.in_flight("p1"), 1);
        assert_eq!(slots.acquisitions("p1"), 2);
        assert_eq!(slots.acquisitions("p2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_full() {
        let slots = ProxySlots::new(1);
        let _held = slots.acquire("p1", Duration::from_secs(1)).await.unwrap();

        let waited = slots.acquire("p1", Duration::from_secs(5)).await;
        assert!(waited.is_none());
        assert_eq!(slots.acquisitions("p1"), 1);

        // Other proxies are unaffected
        assert!(slots.acquire("p2", Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let slots = Arc::new(ProxySlots::new(1));
        let held = slots.acquire("p1", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move { slots.acquire("p1", Duration::from_secs(5)).await.is_some() })
        };

        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
