//! Process orchestration
//!
//! Brings the components up in dependency order and tears them down in
//! reverse on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{dialable_host, Config};
use crate::error::Result;
use crate::inject::{Gateway, RotatorLink};
use crate::models::{ensure_authorizations_file, load_authorizations, WorkerStatus};
use crate::proxy::{create_selector, ProxyRotator};
use crate::services::{RedsocksService, RedsocksUpstream};
use crate::shutdown::{Lifecycle, ShutdownState, StopHandle};
use crate::tunnel::{ProcessTunnelClient, TunnelClient, TunnelManager};

/// A spawned accept loop and the handle that stops it
struct ServerTask {
    name: &'static str,
    stop: StopHandle,
    task: JoinHandle<Result<()>>,
}

impl ServerTask {
    fn spawn<F>(name: &'static str, run: impl FnOnce(tokio::sync::watch::Receiver<bool>) -> F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (stop, stop_rx) = StopHandle::new();
        Self {
            name,
            stop,
            task: tokio::spawn(run(stop_rx)),
        }
    }

    async fn stop(self) {
        self.stop.stop();
        match self.task.await {
            Ok(Ok(())) => info!("{} stopped", self.name),
            Ok(Err(e)) => error!("{} error: {}", self.name, e),
            Err(e) => warn!("{} task ended abnormally: {}", self.name, e),
        }
    }
}

/// Running frontgate instance
pub struct App {
    lifecycle: Lifecycle,
    rotator_addr: SocketAddr,
    gateway_addr: SocketAddr,
    manager: TunnelManager,
    redsocks: RedsocksService,
    rotator: Mutex<Option<ServerTask>>,
    gateway: Mutex<Option<ServerTask>>,
}

impl App {
    /// Start every component, spawning real tunnel client processes
    pub async fn start(config: Config) -> Result<Self> {
        let client = Arc::new(ProcessTunnelClient::new(&config.tunnel));
        Self::start_with_client(config, client).await
    }

    /// Start every component with the given tunnel client.
    ///
    /// A rotator bind failure aborts before anything else is started.
    pub async fn start_with_client(config: Config, client: Arc<dyn TunnelClient>) -> Result<Self> {
        let manager = TunnelManager::new(
            config.tunnel.clone(),
            config.gateway_upstream_url()?,
            client,
        );

        let rotator = ProxyRotator::bind(
            &config.rotator,
            manager.pool(),
            create_selector(config.rotator.strategy),
        )
        .await?;
        let rotator_addr = rotator.local_addr();
        let rotator_host = dialable_host(&config.rotator.host).to_string();

        let redsocks = RedsocksService::new(
            config.redsocks.clone(),
            RedsocksUpstream {
                ip: rotator_host.clone(),
                port: rotator_addr.port(),
                login: config.rotator.username.clone(),
                password: config.rotator.password.clone(),
            },
        );
        redsocks.start().await?;

        if let Err(e) = start_tunnels(&config, &manager).await {
            redsocks.stop().await;
            return Err(e);
        }

        let gateway = match bind_gateway(&config, &manager, &rotator_host, rotator_addr).await {
            Ok(gateway) => gateway,
            Err(e) => {
                error!("Gateway failed to start: {}", e);
                manager.stop().await;
                redsocks.stop().await;
                return Err(e);
            }
        };
        let gateway_addr = gateway.local_addr();

        let rotator_task = ServerTask::spawn("Proxy Rotator", |stop| rotator.run(stop));
        let gateway_task = ServerTask::spawn("Domain Fronting", |stop| gateway.run(stop));

        info!("Domain Fronting running on port {}", gateway_addr.port());
        info!("Proxy Rotator running on port {}", rotator_addr.port());

        Ok(Self {
            lifecycle: Lifecycle::new(),
            rotator_addr,
            gateway_addr,
            manager,
            redsocks,
            rotator: Mutex::new(Some(rotator_task)),
            gateway: Mutex::new(Some(gateway_task)),
        })
    }

    pub fn rotator_addr(&self) -> SocketAddr {
        self.rotator_addr
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    pub fn state(&self) -> ShutdownState {
        self.lifecycle.state()
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.manager.statuses()
    }

    pub fn live_tunnels(&self) -> usize {
        self.manager.live_endpoints().len()
    }

    /// Stop Gateway, Tunnel Manager, redsocks and Rotator in that order.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if !self.lifecycle.begin_drain() {
            return;
        }
        info!("Shutting down");

        let gateway = self.gateway.lock().take();
        if let Some(gateway) = gateway {
            gateway.stop().await;
        }

        self.manager.stop().await;
        self.redsocks.stop().await;

        let rotator = self.rotator.lock().take();
        if let Some(rotator) = rotator {
            rotator.stop().await;
        }

        self.lifecycle.mark_stopped();
        info!("frontgate stopped");
    }
}

async fn start_tunnels(config: &Config, manager: &TunnelManager) -> Result<()> {
    ensure_authorizations_file(&config.authorizations_path).await?;
    let authorizations = load_authorizations(&config.authorizations_path).await?;
    info!(
        "Loaded {} authorizations from {}",
        authorizations.len(),
        config.authorizations_path.display()
    );
    manager.start(&authorizations)
}

async fn bind_gateway(
    config: &Config,
    manager: &TunnelManager,
    rotator_host: &str,
    rotator_addr: SocketAddr,
) -> Result<Gateway> {
    let link = RotatorLink::resolve(
        &format!("{}:{}", rotator_host, rotator_addr.port()),
        config.rotator.username.clone(),
        config.rotator.password.clone(),
        manager.pool(),
    )
    .await?;
    Gateway::bind(&config.gateway, link).await
}
