//! Failover proxy selection strategy

use super::ProxySelector;

/// Always prefers the first entry
///
/// Moving past it only happens through health signals: the pool probes
/// forward when the preferred endpoint is blacklisted.
#[derive(Debug, Default)]
pub struct FailoverSelector;

impl FailoverSelector {
    pub fn new() -> Self {
        Self
    }
}

impl ProxySelector for FailoverSelector {
    fn position(&self, pool_size: usize, _request_index: usize) -> Option<usize> {
        (pool_size > 0).then_some(0)
    }

    fn strategy_name(&self) -> &'static str {
        "failover"
    }
}
