//! Instance selection strategies
//!
//! A strategy receives the current snapshot of instances and returns the
//! index of the one to use. The snapshot is borrowed immutably and is never
//! empty when called from [`crate::ServiceDiscovery::get_with`].

use crate::service::Service;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one instance out of a non-empty snapshot
pub trait SelectionStrategy: Send + Sync {
    /// Index of the selected instance
    fn select(&self, instances: &[Service]) -> usize;
}

impl<F> SelectionStrategy for F
where
    F: Fn(&[Service]) -> usize + Send + Sync,
{
    fn select(&self, instances: &[Service]) -> usize {
        self(instances)
    }
}

/// Uniformly random selection (the default)
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn select(&self, instances: &[Service]) -> usize {
        rand::rng().random_range(0..instances.len())
    }
}

/// Cycles through instances in snapshot order
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&self, instances: &[Service]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % instances.len()
    }
}

/// Always the first instance
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstStrategy;

impl SelectionStrategy for FirstStrategy {
    fn select(&self, _instances: &[Service]) -> usize {
        0
    }
}

/// Largest weight a single instance can carry
pub const MAX_WEIGHT: u64 = u32::MAX as u64;

/// Random selection weighted by `metadata["weight"]`
///
/// Missing, non-numeric or non-positive weights count as 1; weights above
/// [`MAX_WEIGHT`] are clamped to it.
#[derive(Debug, Clone)]
pub struct WeightedStrategy {
    key: String,
}

impl WeightedStrategy {
    pub fn new() -> Self {
        Self::with_key("weight")
    }

    /// Read weights from a different metadata key
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn weight(&self, service: &Service) -> u64 {
        service
            .metadata
            .get(&self.key)
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .filter(|w| *w > 0)
            .map_or(1, |w| w.min(MAX_WEIGHT))
    }
}

impl Default for WeightedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for WeightedStrategy {
    fn select(&self, instances: &[Service]) -> usize {
        let total = instances
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(self.weight(s)));
        if total == 0 {
            return 0;
        }

        let mut point = rand::rng().random_range(0..total);

        for (idx, service) in instances.iter().enumerate() {
            let weight = self.weight(service);
            if point < weight {
                return idx;
            }
            point -= weight;
        }

        instances.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(n: usize) -> Vec<Service> {
        (0..n)
            .map(|i| Service::new("api", format!("10.0.0.{}:80", i)).with_instance_id(i.to_string()))
            .collect()
    }

    #[test]
    fn test_single_instance_always_selected() {
        let one = instances(1);
        let strategies: Vec<Box<dyn SelectionStrategy>> = vec![
            Box::new(RandomStrategy),
            Box::new(RoundRobinStrategy::new()),
            Box::new(FirstStrategy),
            Box::new(WeightedStrategy::new()),
        ];

        for strategy in &strategies {
            for _ in 0..10 {
                assert_eq!(strategy.select(&one), 0);
            }
        }
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let many = instances(5);
        for _ in 0..200 {
            assert!(RandomStrategy.select(&many) < 5);
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let many = instances(3);
        let strategy = RoundRobinStrategy::new();
        let picks: Vec<usize> = (0..6).map(|_| strategy.select(&many)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_weighted_prefers_heavy_instance() {
        let mut many = instances(2);
        many[1] = many[1].clone().with_metadata("weight", 1000);

        let strategy = WeightedStrategy::new();
        let heavy = (0..500).filter(|_| strategy.select(&many) == 1).count();
        assert!(heavy > 450);
    }

    #[test]
    fn test_weighted_accepts_string_weights() {
        let service = Service::new("api", "a:1").with_metadata("weight", "7");
        assert_eq!(WeightedStrategy::new().weight(&service), 7);

        let service = Service::new("api", "a:1").with_metadata("weight", 0);
        assert_eq!(WeightedStrategy::new().weight(&service), 1);
    }

    #[test]
    fn test_weighted_huge_weights_do_not_overflow() {
        let mut many = instances(3);
        many[0] = many[0].clone().with_metadata("weight", u64::MAX);
        many[1] = many[1].clone().with_metadata("weight", u64::MAX);
        many[2] = many[2].clone().with_metadata("weight", 5);

        let strategy = WeightedStrategy::new();
        assert_eq!(strategy.weight(&many[0]), MAX_WEIGHT);
        for _ in 0..200 {
            assert!(strategy.select(&many) < 3);
        }
    }

    #[test]
    fn test_weighted_empty_slice() {
        assert_eq!(WeightedStrategy::new().select(&[]), 0);
    }

    #[test]
    fn test_closure_strategy() {
        let last = |instances: &[Service]| instances.len() - 1;
        assert_eq!(last.select(&instances(4)), 3);
    }
}
