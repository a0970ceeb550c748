//! Tunnel Manager: starts one worker per authorization and supervises them

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::error::{GateError, Result};
use crate::models::{AuthorizationRecord, ProxyEndpoint, WorkerState, WorkerStatus};
use crate::proxy::rotation::EndpointSource;
use crate::shutdown::StopHandle;
use crate::tunnel::client::{TunnelClient, WorkerSpec};
use crate::tunnel::pool::EndpointPool;
use crate::tunnel::worker::run_worker;

/// Owns every tunnel worker and the pool they publish into
pub struct TunnelManager {
    config: TunnelConfig,
    upstream_proxy: Url,
    client: Arc<dyn TunnelClient>,
    pool: Arc<EndpointPool>,
    stop: StopHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, upstream_proxy: Url, client: Arc<dyn TunnelClient>) -> Self {
        Self {
            config,
            upstream_proxy,
            client,
            pool: Arc::new(EndpointPool::new()),
            stop: StopHandle::default(),
            tasks: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    /// Pool the rotator reads live endpoints from
    pub fn pool(&self) -> Arc<EndpointPool> {
        self.pool.clone()
    }

    /// Spawn one worker per authorization on sequential ports.
    ///
    /// Returns once every worker is registered; connects proceed
    /// concurrently in the background.
    #[instrument(skip_all, fields(count = authorizations.len()))]
    pub fn start(&self, authorizations: &[AuthorizationRecord]) -> Result<()> {
        let mut started = self.started.lock();
        if *started || self.stop.is_stopped() {
            return Err(GateError::InvalidConfig(
                "tunnel manager can only be started once".to_string(),
            ));
        }
        if authorizations.is_empty() {
            return Err(GateError::InvalidConfig(
                "no authorizations to start tunnel workers with".to_string(),
            ));
        }

        // Validate the whole port range before anything is spawned
        let ports = authorizations
            .iter()
            .enumerate()
            .map(|(i, _)| {
                u16::try_from(i)
                    .ok()
                    .and_then(|offset| self.config.base_port.checked_add(offset))
                    .ok_or_else(|| {
                        GateError::InvalidConfig(format!(
                            "{} authorizations do not fit above port {}",
                            authorizations.len(),
                            self.config.base_port
                        ))
                    })
            })
            .collect::<Result<Vec<u16>>>()?;

        let remote_port = self.upstream_proxy.port_or_known_default().unwrap_or(0);
        let mut tasks = self.tasks.lock();

        for (worker_id, (authorization, local_port)) in
            authorizations.iter().zip(ports).enumerate()
        {
            let spec = WorkerSpec {
                worker_id,
                authorization: authorization.clone(),
                region: self.config.region.clone(),
                local_port,
                remote_port,
                upstream_proxy: self.upstream_proxy.clone(),
                tunnel_pool_size: self.config.desired_count,
                worker_pool_size: self.config.worker_pool_size,
            };

            self.pool.register(WorkerStatus {
                worker_id,
                local_port,
                remote_port,
                region: spec.region.clone(),
                state: WorkerState::Starting,
                last_error: None,
            });

            tasks.push(tokio::spawn(run_worker(
                spec,
                self.client.clone(),
                self.pool.clone(),
                self.stop.subscribe(),
            )));
        }

        *started = true;
        info!(
            "Started {} tunnel workers on ports {}-{}",
            authorizations.len(),
            self.config.base_port,
            self.config.base_port as usize + authorizations.len() - 1
        );
        Ok(())
    }

    /// Stop every worker and wait until each has released its port.
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        self.stop.stop();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        info!("Stopping {} tunnel workers", tasks.len());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Tunnel worker task ended abnormally: {}", e);
            }
        }
        info!("Tunnel manager stopped");
    }

    pub fn live_endpoints(&self) -> Arc<Vec<ProxyEndpoint>> {
        self.pool.live_endpoints()
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.pool.statuses()
    }
}
