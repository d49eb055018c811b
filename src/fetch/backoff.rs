//! Retry delay computation
//!
//! Exponential growth clamped to a window, multiplied by a jitter factor and
//! raised (never lowered) by a server supplied `Retry-After` header.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::config::FetchTuning;

/// Status codes worth another attempt at the same URL
pub const RETRYABLE_STATUS_CODES: [u16; 9] = [408, 409, 423, 425, 429, 500, 502, 503, 504];

/// Check whether an HTTP status is retryable
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Delay schedule for one class of requests
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Attempts for a URL before giving up (429 bonus not included)
    pub max_attempts: u32,
    pub extra_attempts_for_429: u32,
    /// Longest `Retry-After` worth waiting for; beyond it the URL is given up
    pub max_retry_after: Duration,
}

impl BackoffPolicy {
    /// Schedule used for batch items
    pub fn for_items(tuning: &FetchTuning) -> Self {
        Self {
            initial: tuning.retry_delay,
            factor: tuning.backoff_factor,
            min_delay: tuning.base_delay,
            max_delay: tuning.max_retry_delay,
            jitter_min: tuning.jitter_min,
            jitter_max: tuning.jitter_max,
            max_attempts: tuning.max_retries.max(1),
            extra_attempts_for_429: tuning.extra_attempts_for_429,
            max_retry_after: tuning.max_retry_after,
        }
    }

    /// Schedule used per chapter candidate URL
    pub fn for_chapters(tuning: &FetchTuning) -> Self {
        Self {
            initial: tuning.chapter_retry_min_delay,
            factor: tuning.backoff_factor,
            min_delay: tuning.chapter_retry_min_delay,
            max_delay: tuning.chapter_retry_max_delay,
            jitter_min: tuning.chapter_retry_jitter_min,
            jitter_max: tuning.chapter_retry_jitter_max,
            max_attempts: tuning.chapter_retry_attempts.max(1),
            extra_attempts_for_429: tuning.extra_attempts_for_429,
            max_retry_after: tuning.max_retry_after,
        }
    }

    /// Same schedule with jitter pinned to 1.0
    pub fn without_jitter(mut self) -> Self {
        self.jitter_min = 1.0;
        self.jitter_max = 1.0;
        self
    }

    /// Delay before jitter: `clamp(initial * factor^(attempt-1), min, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let clamped = raw
            .max(self.min_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());

        if clamped.is_finite() {
            Duration::from_secs_f64(clamped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Wait before the attempt following `attempt`
    ///
    /// `Retry-After` only counts on retryable responses and only ever extends
    /// the computed wait.
    pub fn next_delay(
        &self,
        attempt: u32,
        status: Option<u16>,
        retry_after: Option<&str>,
    ) -> Duration {
        let jittered = self.base_delay(attempt).mul_f64(self.sample_jitter());

        match server_hint(status, retry_after) {
            Some(hint) => jittered.max(hint),
            None => jittered,
        }
    }

    /// Whether the server asked for a longer wait than `max_retry_after`
    ///
    /// Callers give up on the URL instead of waiting less than asked.
    pub fn exceeds_retry_after_limit(&self, status: Option<u16>, retry_after: Option<&str>) -> bool {
        server_hint(status, retry_after).is_some_and(|hint| hint > self.max_retry_after)
    }

    /// Total attempts allowed, including the 429 bonus when one was seen
    pub fn attempt_budget(&self, saw_429: bool) -> u32 {
        if saw_429 {
            self.max_attempts + self.extra_attempts_for_429
        } else {
            self.max_attempts
        }
    }

    fn sample_jitter(&self) -> f64 {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min.max(0.0);
        }
        rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
    }
}

fn server_hint(status: Option<u16>, retry_after: Option<&str>) -> Option<Duration> {
    match status {
        Some(code) if is_retryable_status(code) => {
            retry_after.and_then(|value| parse_retry_after(value, Utc::now()))
        }
        _ => None,
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date
///
/// Dates in the past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
