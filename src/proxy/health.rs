//! Per-proxy health tracking
//!
//! Outcomes of real transfers feed a record per proxy key. Crossing the
//! failure or slow-hit threshold blacklists the proxy for a penalty window;
//! windows expire lazily on the next read.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::FetchTuning;
use crate::models::mask_key;

/// Thresholds and penalties for health decisions
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub failure_penalty: Duration,
    pub slow_hits_threshold: u32,
    pub slow_penalty: Duration,
    pub min_speed_bytes_per_sec: u64,
    pub min_duration_for_speed_check: Duration,
    pub min_size_for_speed_check: u64,
    /// Upper bound of the moving-average window, in transfers
    pub speed_window: u32,
    /// Minimum spacing of warning lines for one proxy
    pub warn_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&FetchTuning::default())
    }
}

impl From<&FetchTuning> for HealthConfig {
    fn from(tuning: &FetchTuning) -> Self {
        Self {
            failure_threshold: tuning.failure_threshold.max(1),
            failure_penalty: tuning.failure_penalty,
            slow_hits_threshold: tuning.slow_hits_threshold.max(1),
            slow_penalty: tuning.slow_penalty,
            min_speed_bytes_per_sec: tuning.min_speed_bytes_per_sec,
            min_duration_for_speed_check: tuning.min_duration_for_speed_check,
            min_size_for_speed_check: tuning.min_size_for_speed_check,
            speed_window: tuning.speed_window.max(1),
            warn_cooldown: tuning.warn_cooldown,
        }
    }
}

/// Rolling health state of one proxy
#[derive(Debug, Clone, Default)]
pub struct ProxyHealthRecord {
    pub successes: u64,
    pub failures: u32,
    pub slow_hits: u32,
    pub avg_speed_bytes_per_sec: Option<f64>,
    pub blacklisted_until: Option<Instant>,
    pub last_failure_reason: Option<String>,
}

impl ProxyHealthRecord {
    fn blacklist_for(&mut self, penalty: Duration) {
        let until = Instant::now() + penalty;
        self.blacklisted_until = Some(match self.blacklisted_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }
}

/// How a successful transfer was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferQuality {
    Clean,
    Slow,
}

/// Health records for every proxy the engine has used
pub struct HealthTracker {
    config: HealthConfig,
    records: Mutex<HashMap<String, ProxyHealthRecord>>,
    warn_limiter: DefaultKeyedRateLimiter<String>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        let quota = Quota::with_period(config.warn_cooldown)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);

        Self {
            config,
            records: Mutex::new(HashMap::new()),
            warn_limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether `key` is inside a blacklist window; expired windows are cleared
    pub fn is_blacklisted(&self, key: &str) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(key) else {
            return false;
        };

        match record.blacklisted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                record.blacklisted_until = None;
                debug!(proxy = %mask_key(key), "Blacklist window expired");
                false
            }
            None => false,
        }
    }

    /// Record a completed transfer of `bytes` that took `duration`
    pub fn record_success(&self, key: &str, duration: Duration, bytes: u64) -> TransferQuality {
        let cfg = &self.config;
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_default();

        let secs = duration.as_secs_f64().max(0.001);
        let speed = bytes as f64 / secs;
        let window = (record.successes + 1).min(cfg.speed_window as u64) as f64;
        record.avg_speed_bytes_per_sec = Some(match record.avg_speed_bytes_per_sec {
            Some(avg) => avg + (speed - avg) / window,
            None => speed,
        });

        let slow = bytes >= cfg.min_size_for_speed_check
            && duration >= cfg.min_duration_for_speed_check
            && speed < cfg.min_speed_bytes_per_sec as f64;

        if !slow {
            record.successes += 1;
            record.failures = record.failures.saturating_sub(1);
            record.slow_hits = record.slow_hits.saturating_sub(1);
            return TransferQuality::Clean;
        }

        record.slow_hits += 1;
        let slow_hits = record.slow_hits;
        if slow_hits >= cfg.slow_hits_threshold {
            record.slow_hits = 0;
            record.blacklist_for(cfg.slow_penalty);
            drop(records);
            self.warn(
                key,
                &format!(
                    "slow transfers ({:.0} B/s), excluded for {}s",
                    speed,
                    cfg.slow_penalty.as_secs()
                ),
            );
        } else {
            debug!(proxy = %mask_key(key), slow_hits, speed = speed as u64, "Slow transfer");
        }
        TransferQuality::Slow
    }

    /// Record a failed attempt; returns true when this blacklisted the proxy
    pub fn record_failure(&self, key: &str, reason: &str) -> bool {
        let cfg = &self.config;
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_default();

        record.failures += 1;
        record.last_failure_reason = Some(reason.to_string());

        if record.failures < cfg.failure_threshold {
            debug!(proxy = %mask_key(key), failures = record.failures, reason, "Proxy failure");
            return false;
        }

        record.failures = 0;
        record.blacklist_for(cfg.failure_penalty);
        drop(records);
        self.warn(
            key,
            &format!(
                "{} consecutive failures (last: {}), excluded for {}s",
                cfg.failure_threshold,
                reason,
                cfg.failure_penalty.as_secs()
            ),
        );
        true
    }

    /// Exclude `key` for `duration` regardless of its counters
    pub fn blacklist(&self, key: &str, duration: Duration, reason: &str) {
        let mut records = self.records.lock();
        let record = records.entry(key.to_string()).or_default();
        record.blacklist_for(duration);
        record.last_failure_reason = Some(reason.to_string());
        drop(records);
        self.warn(
            key,
            &format!("{}, excluded for {}s", reason, duration.as_secs()),
        );
    }

    /// Copy of the current record, if the proxy has been seen
    pub fn snapshot(&self, key: &str) -> Option<ProxyHealthRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Number of keys currently inside a blacklist window
    pub fn blacklisted_count(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| r.blacklisted_until.is_some_and(|until| now < until))
            .count()
    }

    fn warn(&self, key: &str, message: &str) {
        if self.warn_limiter.check_key(&key.to_string()).is_ok() {
            warn!(proxy = %mask_key(key), "Proxy health: {}", message);
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
