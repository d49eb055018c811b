//! Adaptive worker pool (primary tier)

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, instrument};

use super::cancel::CancelHandle;
use super::fetcher::ItemFetcher;
use super::progress::ProgressReporter;
use crate::models::BatchItemResult;

/// Absolute ceiling for an operator supplied worker count
pub const MAX_WORKER_OVERRIDE: usize = 64;

/// Concurrent fetches for a pool of `proxy_count` proxies
///
/// Small pools get explicit caps so a handful of egress paths is not
/// flooded: one proxy (or none) gets 2 workers, two get 4, three to five
/// get 6. Larger pools scale with `per_proxy` up to `global_cap`.
pub fn worker_count(
    proxy_count: usize,
    per_proxy: usize,
    global_cap: usize,
    override_count: Option<usize>,
) -> usize {
    if let Some(count) = override_count {
        return count.clamp(1, MAX_WORKER_OVERRIDE);
    }

    let computed = proxy_count.max(1).saturating_mul(per_proxy.max(1));
    let small_pool_cap = match proxy_count {
        0 | 1 => 2,
        2 => 4,
        3..=5 => 6,
        _ => usize::MAX,
    };

    computed.min(small_pool_cap).clamp(1, global_cap.max(1))
}

/// Runs a batch through a bounded number of concurrent item fetches
pub struct AdaptiveWorkerPool {
    fetcher: Arc<ItemFetcher>,
    workers: usize,
}

impl AdaptiveWorkerPool {
    pub fn new(fetcher: Arc<ItemFetcher>, workers: usize) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fetch every URL; the result has one slot per input, in input order
    ///
    /// Items not dispatched before cancellation are filled with a cancelled
    /// failure. The returned flag is true when that happened.
    #[instrument(skip_all, fields(batch_id = %progress.batch_id(), items = urls.len(), workers = self.workers))]
    pub async fn download_batch(
        &self,
        urls: &[String],
        progress: &ProgressReporter,
        cancel: &CancelHandle,
    ) -> (Vec<BatchItemResult>, bool) {
        info!("Primary download started");
        let mut slots: Vec<Option<BatchItemResult>> = (0..urls.len()).map(|_| None).collect();

        let fetcher = &self.fetcher;
        let mut completions = stream::iter(urls.iter().enumerate())
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|(position, url)| async move {
                let item = fetcher.fetch_item(position + 1, url, cancel).await;
                (position, item)
            })
            .buffer_unordered(self.workers);

        while let Some((position, item)) = completions.next().await {
            progress.complete(&item);
            slots[position] = Some(item);
        }

        let mut cancelled = false;
        let items = slots
            .into_iter()
            .zip(urls)
            .enumerate()
            .map(|(position, (slot, url))| {
                slot.unwrap_or_else(|| {
                    cancelled = true;
                    BatchItemResult::cancelled(position + 1, url.as_str())
                })
            })
            .collect();

        (items, cancelled)
    }
}
