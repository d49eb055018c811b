//! Static pool of egress endpoints

use std::sync::Arc;

use tracing::{info, warn};

use super::health::HealthTracker;
use super::rotation::{create_selector, ProxySelector, RotationStrategy};
use crate::config::ProxyPoolConfig;
use crate::error::Result;
use crate::models::ProxyEndpoint;

/// Ordered list of proxies plus the strategy that picks among them
///
/// An empty pool means direct connections.
pub struct ProxyPool {
    proxies: Vec<Arc<ProxyEndpoint>>,
    strategy: RotationStrategy,
    selector: Box<dyn ProxySelector>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyEndpoint>, strategy: RotationStrategy) -> Self {
        Self {
            proxies: proxies.into_iter().map(Arc::new).collect(),
            strategy,
            selector: create_selector(strategy),
        }
    }

    /// Pool that always connects directly
    pub fn direct() -> Self {
        Self::new(Vec::new(), RotationStrategy::default())
    }

    /// Build from configuration; malformed entries fail construction
    pub fn from_config(config: &ProxyPoolConfig) -> Result<Self> {
        if !config.enabled {
            info!("Proxy pool disabled, using direct connections");
            return Ok(Self::direct());
        }

        let mut proxies = Vec::with_capacity(config.entries.len());
        let mut skipped = 0usize;
        for entry in &config.entries {
            match entry.to_endpoint()? {
                Some(endpoint) => proxies.push(endpoint),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(skipped, "Ignoring proxy entries without host or port");
        }
        if proxies.is_empty() {
            warn!("Proxy pool enabled but has no usable entries, using direct connections");
        } else {
            info!(
                count = proxies.len(),
                strategy = config.rotation.as_str(),
                "Proxy pool loaded"
            );
        }

        Ok(Self::new(proxies, config.rotation))
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    pub fn endpoints(&self) -> &[Arc<ProxyEndpoint>] {
        &self.proxies
    }

    /// Strategy choice for `request_index`, ignoring health
    pub fn select(&self, request_index: usize) -> Option<Arc<ProxyEndpoint>> {
        self.selector.select(&self.proxies, request_index)
    }

    /// Health-aware choice for `request_index`
    ///
    /// Probes forward in pool order from the strategy's choice past
    /// blacklisted endpoints. When every endpoint is blacklisted the
    /// strategy's choice is handed back for trial use.
    pub fn select_available(
        &self,
        request_index: usize,
        health: &HealthTracker,
    ) -> Option<Arc<ProxyEndpoint>> {
        let len = self.proxies.len();
        let start = self.selector.position(len, request_index)?;

        (0..len)
            .map(|offset| &self.proxies[(start + offset) % len])
            .find(|proxy| !health.is_blacklisted(proxy.key()))
            .or_else(|| self.proxies.get(start))
            .cloned()
    }
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("size", &self.proxies.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}
