//! Single-item fetch with retries
//!
//! One attempt binds to a health-filtered proxy, holds that proxy's slot for
//! the duration of the request, and reports a typed verdict. The retry loop
//! only ever branches on the verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::cancel::CancelHandle;
use super::cooldown::RateLimitCooldown;
use crate::config::FetchTuning;
use crate::error::CourierError;
use crate::fetch::{is_retryable_status, BackoffPolicy, HttpClient, PayloadSink};
use crate::models::{AttemptOutcome, BatchItemResult, FetchAttempt, ProxyEndpoint, RecoveryTier};
use crate::proxy::{HealthTracker, ProxyPool, ProxySlots};

/// What one attempt amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Body accepted by the sink
    Stored { payload_ref: String, bytes: u64 },
    /// Worth another attempt at the same URL
    Transient {
        reason: String,
        status: Option<u16>,
        retry_after: Option<String>,
    },
    /// This URL will not work; retrying it is pointless
    Permanent { reason: String },
}

impl Verdict {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Verdict::Stored { .. } => AttemptOutcome::Success,
            Verdict::Transient { .. } => AttemptOutcome::TransientFailure,
            Verdict::Permanent { .. } => AttemptOutcome::PermanentFailure,
        }
    }

    fn transient(reason: impl Into<String>) -> Self {
        Verdict::Transient {
            reason: reason.into(),
            status: None,
            retry_after: None,
        }
    }
}

/// Verdict plus the attempt record that goes into the item history
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub record: FetchAttempt,
    pub verdict: Verdict,
}

/// Everything one attempt needs, shared by all workers and tiers
pub struct ItemFetcher {
    client: Arc<dyn HttpClient>,
    pool: Arc<ProxyPool>,
    health: Arc<HealthTracker>,
    slots: Arc<ProxySlots>,
    cooldown: Arc<RateLimitCooldown>,
    sink: Arc<dyn PayloadSink>,
    policy: BackoffPolicy,
    base_delay: Duration,
    slot_timeout: Duration,
    min_payload_bytes: usize,
}

impl ItemFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn HttpClient>,
        pool: Arc<ProxyPool>,
        health: Arc<HealthTracker>,
        slots: Arc<ProxySlots>,
        cooldown: Arc<RateLimitCooldown>,
        sink: Arc<dyn PayloadSink>,
        tuning: &FetchTuning,
    ) -> Self {
        Self {
            client,
            pool,
            health,
            slots,
            cooldown,
            sink,
            policy: BackoffPolicy::for_items(tuning),
            base_delay: tuning.base_delay,
            slot_timeout: tuning.slot_timeout,
            min_payload_bytes: tuning.min_payload_bytes,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Pacing delay before a request, raised while a 429 cooldown is active
    pub fn pacing_delay(&self) -> Duration {
        self.cooldown.current_delay(self.base_delay)
    }

    /// Fetch item `index` (1-based) with the primary retry schedule
    ///
    /// A payload already present in the sink short-circuits with zero attempts.
    pub async fn fetch_item(&self, index: usize, url: &str, cancel: &CancelHandle) -> BatchItemResult {
        let mut item = BatchItemResult::pending(index, url);

        if let Some((payload_ref, bytes)) = self.sink.existing(index, url).await {
            debug!(index, "Payload already present, skipping download");
            item.mark_success(payload_ref, bytes, RecoveryTier::Cache);
            return item;
        }

        let mut attempt = 1u32;
        let mut saw_429 = false;

        loop {
            let report = self.attempt_once(index, url, attempt).await;
            item.attempts += 1;
            item.history.push(report.record);

            let (status, retry_after) = match report.verdict {
                Verdict::Stored { payload_ref, bytes } => {
                    item.mark_success(payload_ref, bytes, RecoveryTier::Primary);
                    return item;
                }
                Verdict::Permanent { reason } => {
                    debug!(index, reason = %reason, "Permanent failure");
                    item.error = Some(reason);
                    return item;
                }
                Verdict::Transient {
                    reason,
                    status,
                    retry_after,
                } => {
                    item.error = Some(reason);
                    (status, retry_after)
                }
            };

            saw_429 |= status == Some(429);
            if attempt >= self.policy.attempt_budget(saw_429) || cancel.is_cancelled() {
                return item;
            }
            if self
                .policy
                .exceeds_retry_after_limit(status, retry_after.as_deref())
            {
                warn!(
                    index,
                    retry_after = retry_after.as_deref().unwrap_or_default(),
                    "Server asked to wait too long, giving up on item"
                );
                return item;
            }

            let delay = self
                .policy
                .next_delay(attempt, status, retry_after.as_deref());
            warn!(
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = item.error.as_deref().unwrap_or_default(),
                "Retrying item"
            );
            if !cancel.sleep(delay).await {
                return item;
            }
            attempt += 1;
        }
    }

    /// One HTTP try of `url` for item `index`
    pub async fn attempt_once(&self, index: usize, url: &str, attempt_number: u32) -> AttemptReport {
        let proxy = self
            .pool
            .select_available(index.saturating_sub(1), &self.health);

        tokio::time::sleep(self.pacing_delay()).await;

        let started_at = Utc::now();
        let start = Instant::now();
        let (verdict, status, bytes) = self.execute(index, url, proxy.as_deref()).await;

        AttemptReport {
            record: FetchAttempt {
                url: url.to_string(),
                proxy: proxy.as_ref().map(|p| p.masked_key()),
                attempt_number,
                started_at,
                duration_ms: start.elapsed().as_millis() as u64,
                bytes_transferred: bytes,
                http_status: status,
                outcome: verdict.outcome(),
                error: match &verdict {
                    Verdict::Stored { .. } => None,
                    Verdict::Transient { reason, .. } | Verdict::Permanent { reason } => {
                        Some(reason.clone())
                    }
                },
            },
            verdict,
        }
    }

    async fn execute(
        &self,
        index: usize,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> (Verdict, Option<u16>, u64) {
        let _slot = match proxy {
            Some(endpoint) => match self.slots.acquire(endpoint.key(), self.slot_timeout).await {
                Some(guard) => Some(guard),
                None => {
                    let err = CourierError::SlotTimeout {
                        proxy: endpoint.masked_key(),
                        waited_ms: self.slot_timeout.as_millis() as u64,
                    };
                    debug!(error = %err, "Slot wait expired");
                    return (Verdict::transient(err.to_string()), None, 0);
                }
            },
            None => None,
        };

        let start = Instant::now();
        let response = match self.client.get(url, proxy).await {
            Ok(response) => response,
            Err(e) => {
                let reason = e.to_string();
                if !e.is_transient() {
                    return (Verdict::Permanent { reason }, None, 0);
                }
                if let Some(endpoint) = proxy {
                    self.health.record_failure(endpoint.key(), &reason);
                }
                return (Verdict::transient(reason), None, 0);
            }
        };
        let elapsed = start.elapsed();
        let code = response.status.as_u16();
        let bytes = response.body.len() as u64;

        if !response.is_success() {
            let reason = format!("HTTP {}", code);
            if !is_retryable_status(code) {
                return (Verdict::Permanent { reason }, Some(code), bytes);
            }
            if code == 429 {
                self.cooldown.trigger();
            }
            if let Some(endpoint) = proxy {
                self.health.record_failure(endpoint.key(), &reason);
            }
            let verdict = Verdict::Transient {
                reason,
                status: Some(code),
                retry_after: response.retry_after().map(str::to_string),
            };
            return (verdict, Some(code), bytes);
        }

        if response.body.len() < self.min_payload_bytes {
            let err = CourierError::InvalidPayload(format!(
                "{} bytes, expected at least {}",
                bytes, self.min_payload_bytes
            ));
            if let Some(endpoint) = proxy {
                self.health.record_failure(endpoint.key(), "undersized body");
            }
            return (Verdict::transient(err.to_string()), Some(code), bytes);
        }

        if let Some(endpoint) = proxy {
            self.health.record_success(endpoint.key(), elapsed, bytes);
        }

        match self.sink.store(index, url, response.body).await {
            Ok(payload_ref) => (Verdict::Stored { payload_ref, bytes }, Some(code), bytes),
            Err(e) => (
                Verdict::Permanent {
                    reason: format!("failed to store payload: {}", e),
                },
                Some(code),
                bytes,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::client::mock::{ok_body, status, status_with_retry_after, MockClient};
    use crate::fetch::MemorySink;
    use crate::models::ProxyProtocol;
    use crate::proxy::RotationStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "https://img2.example/manga/a/01.jpg";

    struct Harness {
        fetcher: ItemFetcher,
        sink: Arc<MemorySink>,
        health: Arc<HealthTracker>,
        slots: Arc<ProxySlots>,
    }

    fn harness(client: MockClient, proxies: u16) -> Harness {
        let tuning = FetchTuning::default();
        let endpoints = (1..=proxies)
            .map(|i| ProxyEndpoint::new(format!("10.0.0.{}", i), 8080, ProxyProtocol::Http, None).unwrap())
            .collect();
        let sink = Arc::new(MemorySink::new());
        let health = Arc::new(HealthTracker::default());
        let slots = Arc::new(ProxySlots::new(1));
        let fetcher = ItemFetcher::new(
            Arc::new(client),
            Arc::new(ProxyPool::new(endpoints, RotationStrategy::RoundRobin)),
            health.clone(),
            slots.clone(),
            Arc::new(RateLimitCooldown::new(
                tuning.rate_limit_cooldown,
                tuning.rate_limit_multiplier,
            )),
            sink.clone(),
            &tuning,
        );
        Harness {
            fetcher,
            sink,
            health,
            slots,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_network() {
        let client = MockClient::always_ok(2048);
        let h = harness(client.clone(), 0);
        h.sink.insert(1, vec![1u8; 4096]);

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(item.success);
        assert_eq!(item.tier, Some(RecoveryTier::Cache));
        assert_eq!(item.attempts, 0);
        assert_eq!(item.bytes, 4096);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let client = MockClient::new(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(status(503))
            } else {
                Ok(ok_body(2048))
            }
        });
        let h = harness(client, 1);

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(item.success);
        assert_eq!(item.tier, Some(RecoveryTier::Primary));
        assert_eq!(item.attempts, 2);
        assert_eq!(item.payload_ref.as_deref(), Some("memory://1"));
        assert_eq!(item.history[0].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(item.history[0].http_status, Some(503));
        assert_eq!(item.history[1].outcome, AttemptOutcome::Success);
        assert_eq!(item.history[1].proxy.as_deref(), Some("10.0.*.*:8080"));
        assert!(h.sink.get(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_status_is_not_retried() {
        let client = MockClient::new(|_, _| Ok(status(404)));
        let h = harness(client.clone(), 1);

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(!item.success);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.error.as_deref(), Some("HTTP 404"));
        assert_eq!(client.call_count(), 1);
        assert!(h.health.snapshot("10.0.0.1:8080").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undersized_body_is_retried() {
        let client = MockClient::always_ok(10);
        let h = harness(client.clone(), 0);

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(!item.success);
        assert_eq!(item.attempts, 3);
        assert!(item.error.unwrap().starts_with("Payload rejected"));
        assert!(h.sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_earns_bonus_attempts_and_arms_cooldown() {
        let client = MockClient::new(|_, _| Ok(status_with_retry_after(429, "1")));
        let h = harness(client.clone(), 0);
        assert_eq!(h.fetcher.pacing_delay(), Duration::from_millis(200));

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert_eq!(item.attempts, 5);
        assert_eq!(client.call_count(), 5);
        assert_eq!(h.fetcher.pacing_delay(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured_in_full() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let client = MockClient::new(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(status_with_retry_after(503, "100"))
            } else {
                Ok(ok_body(2048))
            }
        });
        let h = harness(client, 0);

        let started = Instant::now();
        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(item.success);
        assert!(started.elapsed() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_limit_gives_up() {
        let client = MockClient::new(|_, _| Ok(status_with_retry_after(429, "300")));
        let h = harness(client.clone(), 0);

        let started = Instant::now();
        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(!item.success);
        assert_eq!(item.attempts, 1);
        assert_eq!(client.call_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_timeout_is_transient_without_penalty() {
        let client = MockClient::always_ok(2048);
        let h = harness(client.clone(), 1);
        let _held = h
            .slots
            .acquire("10.0.0.1:8080", Duration::from_millis(1))
            .await
            .unwrap();

        let report = h.fetcher.attempt_once(1, URL, 1).await;
        match report.verdict {
            Verdict::Transient { reason, .. } => assert!(reason.contains("No slot")),
            other => panic!("unexpected verdict: {:?}", other),
        }
        assert_eq!(report.record.outcome, AttemptOutcome::TransientFailure);
        assert_eq!(client.call_count(), 0);
        assert!(h.health.snapshot("10.0.0.1:8080").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_blacklist_proxy() {
        let client = MockClient::new(|_, _| Ok(status(502)));
        let h = harness(client, 1);

        let item = h.fetcher.fetch_item(1, URL, &CancelHandle::new()).await;
        assert!(!item.success);
        assert!(h.health.is_blacklisted("10.0.0.1:8080"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retries() {
        let client = MockClient::new(|_, _| Ok(status(503)));
        let h = harness(client.clone(), 0);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let item = h.fetcher.fetch_item(1, URL, &cancel).await;
        assert_eq!(item.attempts, 1);
        assert_eq!(client.call_count(), 1);
    }
}
