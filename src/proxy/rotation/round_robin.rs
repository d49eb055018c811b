//! Round-robin proxy selection strategy

use super::ProxySelector;

/// Maps request `i` onto pool position `i mod len`
///
/// Keyed on the request index rather than an internal counter, so every
/// retry of the same item lands on the same endpoint.
#[derive(Debug, Default)]
pub struct RoundRobinSelector;

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self
    }
}

impl ProxySelector for RoundRobinSelector {
    fn position(&self, pool_size: usize, request_index: usize) -> Option<usize> {
        if pool_size == 0 {
            return None;
        }
        Some(request_index % pool_size)
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
