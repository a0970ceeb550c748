use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::TunnelType;

/// How an inbound connection left the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// Straight to the original destination
    Direct,
    /// Through the rotator to a fronting host
    Fronted { front: String, tunnel_type: TunnelType },
    /// Fronting host dialed without the rotator
    FrontedDirect { front: String, tunnel_type: TunnelType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closed,
    Failed,
}

/// Per-client state tracked by the gateway from accept to close
#[derive(Debug, Clone, Serialize)]
pub struct InboundConnection {
    pub client_addr: SocketAddr,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub matched_rule: Option<usize>,
    pub route: Option<Route>,
    pub backend: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub state: ConnectionState,
    pub error: Option<String>,
    #[serde(skip)]
    opened_at: Instant,
}

impl InboundConnection {
    pub fn accepted(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            host: None,
            port: None,
            matched_rule: None,
            route: None,
            backend: None,
            bytes_sent: 0,
            bytes_received: 0,
            state: ConnectionState::Open,
            error: None,
            opened_at: Instant::now(),
        }
    }

    pub fn destination(&self) -> String {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.clone(),
            _ => "unknown".to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn close(&mut self, bytes_sent: u64, bytes_received: u64) {
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
        self.state = ConnectionState::Closed;
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.error = Some(error.to_string());
        self.state = ConnectionState::Failed;
    }
}
