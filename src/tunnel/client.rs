//! Boundary to the external tunnel client

use async_trait::async_trait;
use url::Url;

use crate::error::Result;
use crate::models::AuthorizationRecord;

/// Everything one tunnel client needs to come up
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub worker_id: usize,
    pub authorization: AuthorizationRecord,
    /// Upper-cased egress region, empty for any
    pub region: String,
    /// Port the client exposes its local SOCKS proxy on
    pub local_port: u16,
    /// Port of the upstream proxy (the gateway)
    pub remote_port: u16,
    pub upstream_proxy: Url,
    pub tunnel_pool_size: usize,
    pub worker_pool_size: usize,
}

/// A connected tunnel
#[async_trait]
pub trait TunnelSession: Send {
    /// Resolve when the tunnel goes down on its own, with the reason
    async fn closed(&mut self) -> Result<()>;

    /// Tear the tunnel down and wait until its local port is released
    async fn terminate(&mut self);
}

/// Establishes tunnels for workers
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Bring up a tunnel and return once its local SOCKS port is usable.
    ///
    /// Dropping the returned future before completion must release
    /// anything it started.
    async fn establish(&self, spec: &WorkerSpec) -> Result<Box<dyn TunnelSession>>;
}
