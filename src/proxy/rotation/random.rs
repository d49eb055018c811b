//! Random proxy selection strategy

use rand::Rng;

use super::ProxySelector;

/// Selects a uniformly random position in the pool
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl ProxySelector for RandomSelector {
    fn position(&self, pool_size: usize, _request_index: usize) -> Option<usize> {
        if pool_size == 0 {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..pool_size))
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_stays_in_range() {
        let selector = RandomSelector::new();
        for i in 0..200 {
            let pos = selector.position(5, i).unwrap();
            assert!(pos < 5);
        }
    }

    #[test]
    fn test_random_eventually_visits_every_entry() {
        let selector = RandomSelector::new();
        let mut seen = [false; 3];
        for i in 0..500 {
            seen[selector.position(3, i).unwrap()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
