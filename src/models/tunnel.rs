use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one tunnel worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Starting,
    Connected,
    Failed,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Connected => "connected",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        }
    }

    /// Only connected workers are eligible for dispatch
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Connected)
    }

    /// Failed and Stopped are terminal; a worker never leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Failed | WorkerState::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-only view of a connected worker's local SOCKS address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub worker_id: usize,
    pub addr: SocketAddr,
}

impl ProxyEndpoint {
    pub fn new(worker_id: usize, addr: SocketAddr) -> Self {
        Self { worker_id, addr }
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Point-in-time status of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub local_port: u16,
    pub remote_port: u16,
    pub region: String,
    pub state: WorkerState,
    pub last_error: Option<String>,
}
