//! Round-robin endpoint selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};

use super::EndpointSelector;
use crate::models::ProxyEndpoint;

/// Selects endpoints in round-robin order
///
/// Uses atomic operations for lock-free index tracking.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RoundRobinSelector {
    fn candidates(&self, live: &[ProxyEndpoint]) -> Vec<ProxyEndpoint> {
        if live.is_empty() {
            return Vec::new();
        }

        let start = self.index.fetch_add(1, Ordering::Relaxed) % live.len();
        let mut ordered = live.to_vec();
        ordered.rotate_left(start);
        ordered
    }

    fn mark_used(&self, _endpoint: &ProxyEndpoint) {}

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
