//! Backend rotation strategies
//!
//! This module decides which live tunnel endpoint a rotator request is
//! dispatched to, and in which order the remaining endpoints are retried.

mod least_recent;
mod round_robin;

pub use least_recent::LeastRecentlyUsedSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::Arc;

use crate::models::ProxyEndpoint;

/// Strategy types for endpoint rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    LeastRecentlyUsed,
    RoundRobin,
}

impl RotationStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Self::RoundRobin,
            _ => Self::LeastRecentlyUsed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastRecentlyUsed => "least_recently_used",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// Snapshot provider for the endpoints currently eligible for dispatch
pub trait EndpointSource: Send + Sync {
    /// Current live set; cheap to call on every dispatch
    fn live_endpoints(&self) -> Arc<Vec<ProxyEndpoint>>;
}

/// Trait for endpoint selection strategies
///
/// Implementations keep the only mutable rotation state shared between
/// rotator connections and must update it atomically.
pub trait EndpointSelector: Send + Sync {
    /// Order `live` into dial candidates, most preferred first.
    ///
    /// The first candidate is recorded as used before this returns, so
    /// concurrent callers are spread across endpoints.
    fn candidates(&self, live: &[ProxyEndpoint]) -> Vec<ProxyEndpoint>;

    /// Record a dial attempt against `endpoint`
    fn mark_used(&self, endpoint: &ProxyEndpoint);

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create an endpoint selector based on the strategy type
pub fn create_selector(strategy: RotationStrategy) -> Arc<dyn EndpointSelector> {
    match strategy {
        RotationStrategy::LeastRecentlyUsed => Arc::new(LeastRecentlyUsedSelector::new()),
        RotationStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_strategy_from_str() {
        assert_eq!(
            RotationStrategy::from_str("round-robin"),
            RotationStrategy::RoundRobin
        );
        assert_eq!(
            RotationStrategy::from_str("least_recently_used"),
            RotationStrategy::LeastRecentlyUsed
        );
        assert_eq!(
            RotationStrategy::from_str("unknown"),
            RotationStrategy::LeastRecentlyUsed
        );
    }

    #[test]
    fn test_create_selector_strategy_name() {
        assert_eq!(
            create_selector(RotationStrategy::LeastRecentlyUsed).strategy_name(),
            "least_recently_used"
        );
        assert_eq!(
            create_selector(RotationStrategy::RoundRobin).strategy_name(),
            "round_robin"
        );
    }

    #[test]
    fn test_selectors_return_every_endpoint_once() {
        let live: Vec<ProxyEndpoint> = (0..4)
            .map(|i| ProxyEndpoint::new(i, format!("127.0.0.1:{}", 3081 + i).parse().unwrap()))
            .collect();

        for strategy in [RotationStrategy::LeastRecentlyUsed, RotationStrategy::RoundRobin] {
            let selector = create_selector(strategy);
            let mut candidates = selector.candidates(&live);
            assert_eq!(candidates.len(), live.len());
            candidates.sort();
            assert_eq!(candidates, live);
            assert!(selector.candidates(&[]).is_empty());
        }
    }
}
