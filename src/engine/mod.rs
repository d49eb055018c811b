//! Fetch engine
//!
//! This module provides:
//! - The per-item fetch with retries and health feedback
//! - The adaptive worker pool (primary tier)
//! - The alternate-server and sequential fallback tiers
//! - Progress reporting and cooperative cancellation
//!
//! [`Downloader`] composes all of it and owns the shared state.

pub mod cancel;
pub mod cascade;
pub mod cooldown;
pub mod fetcher;
pub mod progress;
pub mod worker;

pub use cancel::CancelHandle;
pub use cascade::FallbackCascade;
pub use cooldown::RateLimitCooldown;
pub use fetcher::{AttemptReport, ItemFetcher, Verdict};
pub use progress::{ProgressEvent, ProgressReporter};
pub use worker::{worker_count, AdaptiveWorkerPool};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::{Config, FetchTuning, ResolverConfig};
use crate::error::{CourierError, Result};
use crate::fetch::{BackoffPolicy, HttpClient, PayloadSink, ReqwestClient};
use crate::models::{BatchResult, ChapterResolutionRequest, PageAsset};
use crate::proxy::{HealthConfig, HealthTracker, ProxyPool, ProxySlots};
use crate::resolver::{api_headers, ChapterResolver, ImageServers, MirrorSource};

/// Buffered progress events per subscriber
const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Pages of a chapter together with their download result
#[derive(Debug, Clone, Serialize)]
pub struct ChapterDownload {
    pub pages: Vec<PageAsset>,
    pub result: BatchResult,
}

/// Entry point of the engine
///
/// Owns the proxy pool, the health tracker and the per-proxy slots, so
/// health learned in one batch carries over to the next.
pub struct Downloader {
    client: Arc<dyn HttpClient>,
    pool: Arc<ProxyPool>,
    health: Arc<HealthTracker>,
    slots: Arc<ProxySlots>,
    fetcher: Arc<ItemFetcher>,
    mirrors: Arc<dyn MirrorSource>,
    image_servers: ImageServers,
    tuning: FetchTuning,
    resolver: ResolverConfig,
    workers: usize,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Downloader {
    /// Build with a `reqwest` client from configuration
    pub fn new(config: &Config, sink: Arc<dyn PayloadSink>) -> Result<Self> {
        let pool = ProxyPool::from_config(&config.proxy)?;
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(config.http.clone()));
        Self::with_parts(config, pool, client, sink)
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        config: &Config,
        pool: ProxyPool,
        client: Arc<dyn HttpClient>,
        sink: Arc<dyn PayloadSink>,
    ) -> Result<Self> {
        let tuning = config.fetch.clone();
        tuning.validate()?;

        let pool = Arc::new(pool);
        let health = Arc::new(HealthTracker::new(HealthConfig::from(&tuning)));
        let slots = Arc::new(ProxySlots::new(tuning.max_workers_per_proxy));
        let cooldown = Arc::new(RateLimitCooldown::new(
            tuning.rate_limit_cooldown,
            tuning.rate_limit_multiplier,
        ));
        let fetcher = Arc::new(ItemFetcher::new(
            client.clone(),
            pool.clone(),
            health.clone(),
            slots.clone(),
            cooldown,
            sink,
            &tuning,
        ));

        let workers = worker_count(
            pool.len(),
            tuning.max_workers_per_proxy,
            tuning.global_worker_cap,
            tuning.worker_override,
        );
        let image_servers = ImageServers::new(&config.resolver.image_servers);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

        info!(
            proxies = pool.len(),
            strategy = pool.strategy().as_str(),
            workers,
            mirrors = image_servers.len(),
            "Downloader ready"
        );

        Ok(Self {
            client,
            pool,
            health,
            slots,
            fetcher,
            mirrors: Arc::new(image_servers.clone()),
            image_servers,
            tuning,
            resolver: config.resolver.clone(),
            workers,
            progress_tx,
        })
    }

    /// Replace the mirror source used by the alternate-server tier
    pub fn with_mirrors(mut self, mirrors: Arc<dyn MirrorSource>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn slots(&self) -> &ProxySlots {
        &self.slots
    }

    /// Receive a [`ProgressEvent`] for every completed item of every batch
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Fetch `urls` through all tiers; the result is in input order
    pub async fn download_batch(&self, urls: &[String], cancel: &CancelHandle) -> BatchResult {
        self.run(urls, self.mirrors.as_ref(), cancel).await
    }

    /// Resolve a chapter's pages, then fetch them
    ///
    /// Mirrors are taken from configuration, or discovered through the API
    /// when none are configured.
    #[instrument(skip_all, fields(chapter = %request.label()))]
    pub async fn download_chapter(
        &self,
        request: &ChapterResolutionRequest,
        cancel: &CancelHandle,
    ) -> Result<ChapterDownload> {
        let api = self.client.clone_with_headers(api_headers(&self.resolver));
        let proxy = self.pool.select_available(0, &self.health);

        let servers = if self.image_servers.is_empty() {
            ImageServers::discover(
                api.as_ref(),
                proxy.as_deref(),
                &self.resolver.api_base,
                self.resolver.site_id.as_deref(),
                &self.resolver.preferred_server,
            )
            .await?
        } else {
            self.image_servers.clone()
        };
        let image_base = servers
            .primary()
            .ok_or_else(|| CourierError::ResolutionFailed("no image server available".into()))?;

        let resolver = ChapterResolver::new(
            self.resolver.api_base.as_str(),
            image_base,
            BackoffPolicy::for_chapters(&self.tuning),
        );
        let pages = resolver
            .resolve_pages(api.as_ref(), proxy.as_deref(), request, cancel)
            .await?;

        let urls: Vec<String> = pages.iter().map(|page| page.url.clone()).collect();
        let result = self.run(&urls, &servers, cancel).await;
        Ok(ChapterDownload { pages, result })
    }

    async fn run(&self, urls: &[String], mirrors: &dyn MirrorSource, cancel: &CancelHandle) -> BatchResult {
        let batch_id = Uuid::new_v4();
        let progress = ProgressReporter::new(
            batch_id,
            urls.len(),
            self.tuning.progress_every,
            self.tuning.progress_interval,
        )
        .with_events(self.progress_tx.clone());

        let primary = AdaptiveWorkerPool::new(self.fetcher.clone(), self.workers);
        let (mut items, mut cancelled) = primary.download_batch(urls, &progress, cancel).await;

        if !cancelled && !cancel.is_cancelled() {
            let cascade = FallbackCascade::new(
                self.fetcher.clone(),
                self.tuning.sequential_attempts,
                self.tuning
                    .base_delay
                    .saturating_mul(self.tuning.sequential_delay_multiplier),
            );
            cancelled = !cascade.resolve(&mut items, mirrors, cancel).await;
        } else {
            cancelled = true;
        }

        let summary = progress.finish(&items);
        BatchResult {
            batch_id,
            items,
            cancelled,
            summary,
        }
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("pool", &self.pool)
            .field("workers", &self.workers)
            .field("mirrors", &self.image_servers.len())
            .finish()
    }
}
