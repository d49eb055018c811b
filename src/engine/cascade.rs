//! Fallback tiers run over the primary result
//!
//! Tier 2 retries each failed item once per alternate mirror. Tier 3 walks
//! the remaining failures one at a time with long pauses in between.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::cancel::CancelHandle;
use super::fetcher::{ItemFetcher, Verdict};
use crate::models::{AttemptOutcome, BatchItemResult, RecoveryTier};
use crate::resolver::MirrorSource;

/// Alternate-server and sequential recovery over failed items
pub struct FallbackCascade {
    fetcher: Arc<ItemFetcher>,
    sequential_attempts: u32,
    sequential_delay: Duration,
}

impl FallbackCascade {
    pub fn new(fetcher: Arc<ItemFetcher>, sequential_attempts: u32, sequential_delay: Duration) -> Self {
        Self {
            fetcher,
            sequential_attempts,
            sequential_delay,
        }
    }

    /// Run tiers 2 and 3 over the failures in `items`, in place
    ///
    /// Successful items are never touched. Returns false when cancellation
    /// cut the cascade short.
    #[instrument(skip_all, fields(failed = items.iter().filter(|i| !i.success).count()))]
    pub async fn resolve(
        &self,
        items: &mut [BatchItemResult],
        mirrors: &dyn MirrorSource,
        cancel: &CancelHandle,
    ) -> bool {
        if items.iter().all(|item| item.success) {
            return true;
        }

        if !self.alternate_servers(items, mirrors, cancel).await {
            return false;
        }
        self.sequential(items, cancel).await
    }

    async fn alternate_servers(
        &self,
        items: &mut [BatchItemResult],
        mirrors: &dyn MirrorSource,
        cancel: &CancelHandle,
    ) -> bool {
        let mut recovered = 0usize;

        for item in items.iter_mut().filter(|item| !item.success) {
            let alternates = mirrors.alternates(&item.url);
            if alternates.is_empty() {
                continue;
            }

            for alternate in alternates {
                if cancel.is_cancelled() {
                    return false;
                }
                if self.try_once(item, &alternate, RecoveryTier::AlternateServer).await {
                    recovered += 1;
                    break;
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered items from alternate servers");
        }
        true
    }

    async fn sequential(&self, items: &mut [BatchItemResult], cancel: &CancelHandle) -> bool {
        let remaining = items.iter().filter(|item| needs_sequential(item)).count();
        if remaining == 0 || self.sequential_attempts == 0 {
            return true;
        }

        warn!(
            remaining,
            delay_ms = self.sequential_delay.as_millis() as u64,
            "Starting sequential fallback"
        );

        for item in items.iter_mut().filter(|item| needs_sequential(item)) {
            for _ in 0..self.sequential_attempts {
                if !cancel.sleep(self.sequential_delay).await {
                    return false;
                }
                let url = item.url.clone();
                if self.try_once(item, &url, RecoveryTier::Sequential).await {
                    warn!(index = item.index, "Item recovered by sequential fallback");
                    break;
                }
                if permanently_failed(item, &url) {
                    break;
                }
            }

            if !item.success {
                warn!(
                    index = item.index,
                    error = item.error.as_deref().unwrap_or_default(),
                    "Item failed after sequential fallback"
                );
            }
        }
        true
    }

    /// One attempt of `url` on behalf of `item`; true when it succeeded
    async fn try_once(&self, item: &mut BatchItemResult, url: &str, tier: RecoveryTier) -> bool {
        let report = self
            .fetcher
            .attempt_once(item.index, url, item.attempts + 1)
            .await;
        item.attempts += 1;
        item.history.push(report.record);

        match report.verdict {
            Verdict::Stored { payload_ref, bytes } => {
                item.mark_success(payload_ref, bytes, tier);
                true
            }
            Verdict::Transient { reason, .. } | Verdict::Permanent { reason } => {
                item.error = Some(reason);
                false
            }
        }
    }
}

/// Failed items whose own URL has not been answered with a permanent status
fn needs_sequential(item: &BatchItemResult) -> bool {
    !item.success && !permanently_failed(item, &item.url)
}

fn permanently_failed(item: &BatchItemResult, url: &str) -> bool {
    item.history
        .iter()
        .any(|attempt| attempt.url == url && attempt.outcome == AttemptOutcome::PermanentFailure)
}
