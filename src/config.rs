use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{GateError, Result};
use crate::inject::extract::ExtractorKind;
use crate::models::{FrontTarget, HostPattern, RoutingRule, TunnelType};
use crate::proxy::rotation::RotationStrategy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SOCKS5 rotator configuration
    pub rotator: RotatorConfig,
    /// Domain-fronting gateway configuration
    pub gateway: GatewayConfig,
    /// Tunnel worker configuration
    pub tunnel: TunnelConfig,
    /// Transparent proxy daemon integration
    pub redsocks: RedsocksConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Line-oriented authorization token file
    pub authorizations_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the SOCKS5 front (default: 3080)
    pub port: u16,
    /// Required SOCKS5 username
    pub username: String,
    /// Required SOCKS5 password
    pub password: String,
    /// Relay chunk size in bytes
    pub buffer_size: usize,
    /// Dial timeout per backend endpoint
    pub connect_timeout: Duration,
    /// Backend selection policy
    pub strategy: RotationStrategy,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for redirected inbound traffic (default: 8989)
    pub port: u16,
    /// How long one accept wait may block before the stop flag is re-checked
    pub accept_timeout: Duration,
    /// Dial timeout for direct and fronted connections
    pub connect_timeout: Duration,
    /// Relay chunk size in bytes
    pub buffer_size: usize,
    /// Routing rules, first match wins
    pub rules: Vec<RoutingRule>,
    /// How the original destination is recovered
    pub extractor: ExtractorKind,
    /// Dial the front host directly when the rotator has no live tunnel
    pub front_fallback_direct: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Tunnels requested from each tunnel client
    pub desired_count: usize,
    /// Internal connection workers per tunnel client
    pub worker_pool_size: usize,
    /// Egress region, upper-cased, empty for any
    pub region: String,
    /// First local port handed to a worker
    pub base_port: u16,
    /// External tunnel client executable
    pub binary: PathBuf,
    /// Directory holding per-worker config and data
    pub work_dir: PathBuf,
    /// Deadline for a worker to expose its local SOCKS port
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedsocksConfig {
    /// Whether the daemon is managed at all
    pub enabled: bool,
    /// Daemon executable
    pub binary: PathBuf,
    /// Generated config file
    pub config_path: PathBuf,
    /// Daemon log file
    pub log_path: PathBuf,
    /// Port the daemon listens on for redirected traffic
    pub local_port: u16,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
    /// Lower the default level to debug
    pub verbose: bool,
    /// Optional file receiving log lines instead of stdout
    pub file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let rotator_port: u16 = parse_port("ROTATOR_PORT", "3080")?;
        let gateway_port: u16 = parse_port("GATEWAY_PORT", "8989")?;

        let buffer_size: usize = get_env_or("ROTATOR_BUFFER_SIZE", "65535")
            .parse()
            .map_err(|_| invalid_number("ROTATOR_BUFFER_SIZE"))?;
        if buffer_size == 0 {
            return Err(GateError::InvalidConfig(
                "ROTATOR_BUFFER_SIZE must be greater than zero".into(),
            ));
        }

        let desired_count: usize = get_env_or("TUNNEL_COUNT", "4")
            .parse()
            .map_err(|_| invalid_number("TUNNEL_COUNT"))?;
        let desired_count = desired_count.max(1);

        let tunnel_type = TunnelType::from_code(&get_env_or("GATEWAY_TUNNEL_TYPE", "3"))
            .ok_or_else(|| {
                GateError::InvalidConfig("GATEWAY_TUNNEL_TYPE must be 0 or 3".into())
            })?;

        let rule = RoutingRule::new(
            parse_list(&get_env_or("GATEWAY_WHITELIST", ""))
                .unwrap_or_else(default_whitelist)
                .iter()
                .map(|entry| HostPattern::parse(entry))
                .collect::<Result<Vec<_>>>()?,
            tunnel_type,
            parse_list(&get_env_or("GATEWAY_FRONT_DOMAINS", ""))
                .unwrap_or_else(default_front_domains)
                .iter()
                .map(|entry| FrontTarget::parse(entry))
                .collect::<Result<Vec<_>>>()?,
        )?;

        let extractor = ExtractorKind::from_str(&get_env_or("GATEWAY_EXTRACTOR", "auto"))
            .ok_or_else(|| {
                GateError::InvalidConfig("GATEWAY_EXTRACTOR must be auto, http or sni".into())
            })?;

        let strategy = RotationStrategy::from_str(&get_env_or(
            "ROTATOR_STRATEGY",
            "least_recently_used",
        ));

        let file = env::var("LOG_FILE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Config {
            rotator: RotatorConfig {
                host: get_env_or("ROTATOR_HOST", "0.0.0.0"),
                port: rotator_port,
                username: get_env_or("ROTATOR_USERNAME", "frontgate"),
                password: get_env_or("ROTATOR_PASSWORD", "frontgate"),
                buffer_size,
                connect_timeout: parse_secs("ROTATOR_CONNECT_TIMEOUT", "10")?,
                strategy,
            },
            gateway: GatewayConfig {
                host: get_env_or("GATEWAY_HOST", "0.0.0.0"),
                port: gateway_port,
                accept_timeout: Duration::from_millis(parse_positive(
                    "GATEWAY_ACCEPT_TIMEOUT_MS",
                    "1000",
                )?),
                connect_timeout: parse_secs("GATEWAY_CONNECT_TIMEOUT", "10")?,
                buffer_size,
                rules: vec![rule],
                extractor,
                front_fallback_direct: parse_bool("GATEWAY_FRONT_FALLBACK_DIRECT", "true")?,
            },
            tunnel: TunnelConfig {
                desired_count,
                worker_pool_size: worker_pool_size(desired_count),
                region: get_env_or("TUNNEL_REGION", "").trim().to_uppercase(),
                base_port: rotator_port.checked_add(1).ok_or_else(|| {
                    GateError::InvalidConfig("ROTATOR_PORT leaves no room for tunnel ports".into())
                })?,
                binary: PathBuf::from(get_env_or("TUNNEL_BINARY", "psiphon-tunnel-core")),
                work_dir: PathBuf::from(get_env_or("TUNNEL_WORK_DIR", "storage/tunnels")),
                connect_timeout: parse_secs("TUNNEL_CONNECT_TIMEOUT", "60")?,
            },
            redsocks: RedsocksConfig {
                enabled: parse_bool("REDSOCKS_ENABLED", "true")?,
                binary: PathBuf::from(get_env_or("REDSOCKS_BINARY", "redsocks")),
                config_path: PathBuf::from(get_env_or(
                    "REDSOCKS_CONFIG",
                    "storage/redsocks/redsocks.conf",
                )),
                log_path: PathBuf::from(get_env_or(
                    "REDSOCKS_LOG",
                    "storage/redsocks/redsocks.log",
                )),
                local_port: parse_port("REDSOCKS_LOCAL_PORT", "3070")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
                verbose: parse_bool("LOG_VERBOSE", "false")?,
                file,
            },
            authorizations_path: PathBuf::from(get_env_or(
                "AUTHORIZATIONS_FILE",
                "authorizations.txt",
            )),
        })
    }

    /// Get the rotator listen address
    pub fn rotator_addr(&self) -> String {
        format!("{}:{}", self.rotator.host, self.rotator.port)
    }

    /// Get the gateway listen address
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }

    /// Upstream proxy URL handed to tunnel clients (the gateway).
    pub fn gateway_upstream_url(&self) -> Result<Url> {
        let url = Url::parse(&format!(
            "http://{}:{}",
            dialable_host(&self.gateway.host),
            self.gateway.port
        ))?;
        Ok(url)
    }
}

/// Connection worker pool size derived from the desired tunnel count
pub fn worker_pool_size(desired_count: usize) -> usize {
    if desired_count <= 4 {
        8
    } else {
        desired_count + 4
    }
}

/// Loopback stand-in for a wildcard bind host
pub(crate) fn dialable_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

/// Split a comma separated list, dropping blank entries and sorting the rest.
///
/// Returns `None` when nothing usable is left so the caller can apply defaults.
pub fn parse_list(raw: &str) -> Option<Vec<String>> {
    let mut entries: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if entries.is_empty() {
        return None;
    }

    entries.sort();
    Some(entries)
}

fn default_whitelist() -> Vec<String> {
    vec!["akamai.net".to_string()]
}

fn default_front_domains() -> Vec<String> {
    let mut domains = vec![
        "video.iflix.com".to_string(),
        "videocdn-2.iflix.com".to_string(),
    ];
    for i in [1, 2, 3, 6, 7, 8] {
        domains.push(format!("iflix-videocdn-p{}.akamaized.net", i));
    }
    domains.sort();
    domains
}

fn parse_port(key: &str, default: &str) -> Result<u16> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| GateError::InvalidConfig(format!("{} must be a valid port number", key)))
}

/// Parse a timeout given in whole seconds; zero is rejected
fn parse_secs(key: &str, default: &str) -> Result<Duration> {
    parse_positive(key, default).map(Duration::from_secs)
}

fn parse_positive(key: &str, default: &str) -> Result<u64> {
    let value: u64 = get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| invalid_number(key))?;
    if value == 0 {
        return Err(GateError::InvalidConfig(format!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(value)
}

fn parse_bool(key: &str, default: &str) -> Result<bool> {
    match get_env_or(key, default).trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(GateError::InvalidConfig(format!(
            "{} must be true or false",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn invalid_number(key: &str) -> GateError {
    GateError::InvalidConfig(format!("{} must be a valid number", key))
}
