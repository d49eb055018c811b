//! Pool-wide rate limit cooldown

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Multiplies the pacing delay of every request for a window after a 429
///
/// Shared by all workers; a new 429 extends the window.
#[derive(Debug)]
pub struct RateLimitCooldown {
    window: Duration,
    multiplier: f64,
    until: Mutex<Option<Instant>>,
}

impl RateLimitCooldown {
    pub fn new(window: Duration, multiplier: f64) -> Self {
        Self {
            window,
            multiplier: multiplier.max(1.0),
            until: Mutex::new(None),
        }
    }

    /// Arm (or extend) the cooldown window
    pub fn trigger(&self) {
        let until = Instant::now() + self.window;
        let mut current = self.until.lock();
        let first = !current.is_some_and(|existing| existing > Instant::now());
        *current = Some(until);
        drop(current);

        if first {
            warn!(
                window_secs = self.window.as_secs(),
                multiplier = self.multiplier,
                "Rate limited, slowing down all requests"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    /// `base` while idle, `base * multiplier` inside the window
    pub fn current_delay(&self, base: Duration) -> Duration {
        if self.is_active() {
            base.mul_f64(self.multiplier)
        } else {
            base
        }
    }
}
