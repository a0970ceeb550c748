//! Least-recently-used endpoint selection strategy

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use super::EndpointSelector;
use crate::models::ProxyEndpoint;

#[derive(Debug, Default)]
struct UsageLog {
    /// Monotonic use counter, higher is more recent
    clock: u64,
    last_used: HashMap<SocketAddr, u64>,
}

impl UsageLog {
    fn touch(&mut self, addr: SocketAddr) {
        self.clock += 1;
        self.last_used.insert(addr, self.clock);
    }
}

/// Prefers the endpoint that was dispatched to least recently
///
/// Never-used endpoints come first, in live-set order.
pub struct LeastRecentlyUsedSelector {
    usage: Mutex<UsageLog>,
}

impl LeastRecentlyUsedSelector {
    pub fn new() -> Self {
        Self {
            usage: Mutex::new(UsageLog::default()),
        }
    }
}

impl Default for LeastRecentlyUsedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for LeastRecentlyUsedSelector {
    fn candidates(&self, live: &[ProxyEndpoint]) -> Vec<ProxyEndpoint> {
        let mut usage = self.usage.lock();

        // Forget endpoints that left the live set so a returning port starts fresh
        usage
            .last_used
            .retain(|addr, _| live.iter().any(|e| e.addr == *addr));

        let mut ordered: Vec<ProxyEndpoint> = live.to_vec();
        ordered.sort_by_key(|e| usage.last_used.get(&e.addr).copied().unwrap_or(0));

        if let Some(first) = ordered.first() {
            usage.touch(first.addr);
        }

        ordered
    }

    fn mark_used(&self, endpoint: &ProxyEndpoint) {
        self.usage.lock().touch(endpoint.addr);
    }

    fn strategy_name(&self) -> &'static str {
        "least_recently_used"
    }
}
