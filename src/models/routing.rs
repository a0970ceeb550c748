use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Transport class a routing rule applies to a matched host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    /// Matched but passed through unchanged
    Direct,
    /// Carried to one of the rule's remote proxies
    #[default]
    RemoteProxy,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Direct => "direct",
            TunnelType::RemoteProxy => "remote_proxy",
        }
    }

    /// Parse the numeric code used in rule configuration
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(TunnelType::Direct),
            "3" => Some(TunnelType::RemoteProxy),
            _ => None,
        }
    }

    pub fn fronts(&self) -> bool {
        matches!(self, TunnelType::RemoteProxy)
    }
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One whitelist entry, a domain with an optional required port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPattern {
    host: String,
    port: Option<u16>,
}

impl HostPattern {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        let host: String = host.into();
        Self {
            host: normalize_host(&host),
            port,
        }
    }

    /// Parse `domain` or `domain:port`
    pub fn parse(entry: &str) -> Result<Self> {
        let (host, port) = split_host_port(entry)?;
        if host.is_empty() {
            return Err(GateError::InvalidConfig(format!(
                "empty host in whitelist entry '{}'",
                entry
            )));
        }
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether `host` equals this pattern or is one of its subdomains.
    ///
    /// `host` must already be lower-cased without a trailing dot.
    pub fn matches(&self, host: &str, port: Option<u16>) -> bool {
        if let Some(required) = self.port {
            if port != Some(required) {
                return false;
            }
        }

        if host == self.host {
            return true;
        }

        host.len() > self.host.len()
            && host.ends_with(self.host.as_str())
            && host.as_bytes()[host.len() - self.host.len() - 1] == b'.'
    }
}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// A fronting host presented in place of the real destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontTarget {
    host: String,
    port: Option<u16>,
}

impl FrontTarget {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        let host: String = host.into();
        Self {
            host: normalize_host(&host),
            port,
        }
    }

    /// Parse `host` or `host:port`
    pub fn parse(entry: &str) -> Result<Self> {
        let (host, port) = split_host_port(entry)?;
        if host.is_empty() {
            return Err(GateError::InvalidConfig(format!(
                "empty host in front domain entry '{}'",
                entry
            )));
        }
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to dial, falling back to the port the client asked for
    pub fn port_or(&self, inbound_port: u16) -> u16 {
        self.port.unwrap_or(inbound_port)
    }
}

impl std::fmt::Display for FrontTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Whitelist plus fronting targets, immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    targets: Vec<HostPattern>,
    tunnel_type: TunnelType,
    remote_proxies: Vec<FrontTarget>,
}

impl RoutingRule {
    pub fn new(
        targets: Vec<HostPattern>,
        tunnel_type: TunnelType,
        remote_proxies: Vec<FrontTarget>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(GateError::InvalidConfig(
                "routing rule needs at least one target pattern".into(),
            ));
        }
        if tunnel_type.fronts() && remote_proxies.is_empty() {
            return Err(GateError::InvalidConfig(format!(
                "routing rule of type {} needs at least one remote proxy",
                tunnel_type
            )));
        }

        Ok(Self {
            targets,
            tunnel_type,
            remote_proxies,
        })
    }

    pub fn targets(&self) -> &[HostPattern] {
        &self.targets
    }

    pub fn tunnel_type(&self) -> TunnelType {
        self.tunnel_type
    }

    pub fn remote_proxies(&self) -> &[FrontTarget] {
        &self.remote_proxies
    }

    pub fn matches(&self, host: &str, port: Option<u16>) -> bool {
        self.targets.iter().any(|p| p.matches(host, port))
    }
}

/// Lower-case a host and strip brackets and a trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
pub fn split_host_port(entry: &str) -> Result<(String, Option<u16>)> {
    let entry = entry.trim();

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            GateError::InvalidConfig(format!("unterminated IPv6 literal in '{}'", entry))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(entry, p)?),
            None if tail.is_empty() => None,
            None => {
                return Err(GateError::InvalidConfig(format!(
                    "unexpected characters after IPv6 literal in '{}'",
                    entry
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match entry.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port
        Some((host, _)) if host.contains(':') => Ok((entry.to_string(), None)),
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(entry, port)?))),
        None => Ok((entry.to_string(), None)),
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| GateError::InvalidConfig(format!("invalid port in '{}'", entry)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_type_codes() {
        assert_eq!(TunnelType::from_code("0"), Some(TunnelType::Direct));
        assert_eq!(TunnelType::from_code(" 3 "), Some(TunnelType::RemoteProxy));
        assert_eq!(TunnelType::from_code("1"), None);
        assert!(TunnelType::RemoteProxy.fronts());
        assert!(!TunnelType::Direct.fronts());
    }

    #[test]
    fn test_host_pattern_parse() {
        let pattern = HostPattern::parse("CDN.net:443").unwrap();
        assert_eq!(pattern.host(), "cdn.net");
        assert_eq!(pattern.port(), Some(443));
        assert_eq!(pattern.to_string(), "cdn.net:443");

        let pattern = HostPattern::parse("akamai.net").unwrap();
        assert_eq!(pattern.port(), None);

        assert!(HostPattern::parse("cdn.net:http").is_err());
        assert!(HostPattern::parse(":443").is_err());
    }

    #[test]
    fn test_host_pattern_suffix_match() {
        let pattern = HostPattern::parse("akamai.net").unwrap();
        assert!(pattern.matches("akamai.net", None));
        assert!(pattern.matches("sub.akamai.net", Some(443)));
        assert!(pattern.matches("a.b.akamai.net", Some(80)));
        assert!(!pattern.matches("notakamai.net", None));
        assert!(!pattern.matches("akamai.net.evil.com", None));
        assert!(!pattern.matches("net", None));
    }

    #[test]
    fn test_host_pattern_port_must_match() {
        let pattern = HostPattern::parse("cdn.net:443").unwrap();
        assert!(pattern.matches("cdn.net", Some(443)));
        assert!(pattern.matches("img.cdn.net", Some(443)));
        assert!(!pattern.matches("cdn.net", Some(80)));
        assert!(!pattern.matches("cdn.net", None));
    }

    #[test]
    fn test_split_host_port_ipv6() {
        assert_eq!(
            split_host_port("[::1]:8080").unwrap(),
            ("::1".to_string(), Some(8080))
        );
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".to_string(), None));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_string(), None));
        assert!(split_host_port("[::1").is_err());
    }

    #[test]
    fn test_front_target_port_fallback() {
        let front = FrontTarget::parse("a.cdn.example").unwrap();
        assert_eq!(front.port_or(443), 443);

        let front = FrontTarget::parse("a.cdn.example:8443").unwrap();
        assert_eq!(front.port_or(443), 8443);
    }

    #[test]
    fn test_routing_rule_validation() {
        let targets = vec![HostPattern::parse("akamai.net").unwrap()];

        assert!(RoutingRule::new(targets.clone(), TunnelType::RemoteProxy, vec![]).is_err());
        assert!(RoutingRule::new(vec![], TunnelType::Direct, vec![]).is_err());

        let rule = RoutingRule::new(targets, TunnelType::Direct, vec![]).unwrap();
        assert!(rule.matches("www.akamai.net", Some(443)));
        assert!(!rule.matches("example.com", Some(443)));
    }
}
