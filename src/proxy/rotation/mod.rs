//! Proxy rotation strategies
//!
//! Selection is pure: a strategy maps a request index onto a position in the
//! pool. Health filtering happens one layer up in [`ProxyPool`].
//!
//! [`ProxyPool`]: crate::proxy::ProxyPool

mod failover;
mod random;
mod round_robin;

pub use failover::FailoverSelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::Arc;

use crate::models::ProxyEndpoint;

/// Strategy types for proxy rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    Failover,
}

impl RotationStrategy {
    /// Unknown names fall back to round-robin
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "random" => Self::Random,
            "failover" | "fail-over" | "fail_over" => Self::Failover,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Failover => "failover",
        }
    }
}

/// Trait for proxy selection strategies
pub trait ProxySelector: Send + Sync {
    /// Position in `proxies` to use for `request_index`, `None` on an empty pool
    fn position(&self, pool_size: usize, request_index: usize) -> Option<usize>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;

    /// Pick an endpoint for `request_index`
    fn select(
        &self,
        proxies: &[Arc<ProxyEndpoint>],
        request_index: usize,
    ) -> Option<Arc<ProxyEndpoint>> {
        self.position(proxies.len(), request_index)
            .and_then(|pos| proxies.get(pos))
            .cloned()
    }
}

/// Create a proxy selector based on the strategy type
pub fn create_selector(strategy: RotationStrategy) -> Box<dyn ProxySelector> {
    match strategy {
        RotationStrategy::RoundRobin => Box::new(RoundRobinSelector::new()),
        RotationStrategy::Random => Box::new(RandomSelector::new()),
        RotationStrategy::Failover => Box::new(FailoverSelector::new()),
    }
}
