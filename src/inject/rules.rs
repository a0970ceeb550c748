//! Rule Engine: classifies requested hosts against the routing rules

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::models::{normalize_host, split_host_port, FrontTarget, RoutingRule, TunnelType};

/// Outcome of a successful classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Index of the first matching rule
    pub rule_index: usize,
    pub tunnel_type: TunnelType,
    /// Host to present instead of the real destination, for fronting rules
    pub front: Option<FrontTarget>,
}

struct CompiledRule {
    rule: RoutingRule,
    cursor: AtomicUsize,
}

/// First-match classifier over an immutable rule list
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| CompiledRule {
                    rule,
                    cursor: AtomicUsize::new(0),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Match `host` (case-insensitive, suffix on label boundaries).
    ///
    /// Fronting rules hand out their remote proxies round-robin across
    /// calls. `None` means no rule applies and the caller forwards directly.
    pub fn classify(&self, host: &str, port: Option<u16>) -> Option<RuleMatch> {
        let host = normalize_host(host);

        let (rule_index, compiled) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, c)| c.rule.matches(&host, port))?;

        let tunnel_type = compiled.rule.tunnel_type();
        let front = if tunnel_type.fronts() {
            let proxies = compiled.rule.remote_proxies();
            let next = compiled.cursor.fetch_add(1, Ordering::Relaxed);
            proxies.get(next % proxies.len().max(1)).cloned()
        } else {
            None
        };

        debug!(
            host = %host,
            rule = rule_index,
            front = ?front.as_ref().map(|f| f.to_string()),
            "Host matched routing rule"
        );

        Some(RuleMatch {
            rule_index,
            tunnel_type,
            front,
        })
    }

    /// Classify a `host[:port]` string
    pub fn classify_target(&self, target: &str) -> Option<RuleMatch> {
        let (host, port) = split_host_port(target).ok()?;
        self.classify(&host, port)
    }
}
