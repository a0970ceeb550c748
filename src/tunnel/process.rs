//! Tunnel client backed by an external tunnel-core process
//!
//! Each worker gets its own directory under the work dir holding a JSON
//! config and the child's log. The child is ready once its local SOCKS
//! port accepts connections.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::TunnelConfig;
use crate::error::{GateError, Result};
use crate::tunnel::client::{TunnelClient, TunnelSession, WorkerSpec};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-worker configuration file read by the tunnel client
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ClientConfig<'a> {
    authorizations: [&'a str; 1],
    #[serde(skip_serializing_if = "str::is_empty")]
    egress_region: &'a str,
    local_socks_proxy_port: u16,
    upstream_proxy_url: &'a str,
    tunnel_pool_size: usize,
    connection_worker_pool_size: usize,
    data_root_directory: String,
}

/// Spawns one tunnel-core process per worker
pub struct ProcessTunnelClient {
    binary: PathBuf,
    work_dir: PathBuf,
    connect_timeout: Duration,
}

impl ProcessTunnelClient {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            work_dir: config.work_dir.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    fn worker_dir(&self, spec: &WorkerSpec) -> PathBuf {
        self.work_dir.join(format!("worker-{}", spec.local_port))
    }

    async fn spawn(&self, spec: &WorkerSpec) -> anyhow::Result<Child> {
        let dir = self.worker_dir(spec);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;

        let config_path = dir.join("config.json");
        let rendered = render_config(spec, &dir)?;
        tokio::fs::write(&config_path, rendered)
            .await
            .with_context(|| format!("write {}", config_path.display()))?;

        let log_path = dir.join("client.log");
        let log = tokio::fs::File::create(&log_path)
            .await
            .with_context(|| format!("open log {}", log_path.display()))?;
        let log_err = log.try_clone().await.context("clone log file")?;
        let (log, log_err) = (log.into_std().await, log_err.into_std().await);

        let child = Command::new(&self.binary)
            .arg("-config")
            .arg(&config_path)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", self.binary.display()))?;

        debug!(
            "Spawned tunnel client pid={:?} port={} log={}",
            child.id(),
            spec.local_port,
            log_path.display()
        );
        Ok(child)
    }

    async fn wait_ready(&self, child: &mut Child, port: u16) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            if let Some(status) = child.try_wait().context("poll tunnel client")? {
                bail!("tunnel client exited before connecting ({})", status);
            }

            if let Ok(Ok(_)) = timeout(READY_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                bail!(
                    "local port not ready after {}s",
                    self.connect_timeout.as_secs()
                );
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// Serialize the tunnel client config for `spec`
fn render_config(spec: &WorkerSpec, data_dir: &Path) -> anyhow::Result<String> {
    let config = ClientConfig {
        authorizations: [spec.authorization.as_str()],
        egress_region: &spec.region,
        local_socks_proxy_port: spec.local_port,
        upstream_proxy_url: spec.upstream_proxy.as_str(),
        tunnel_pool_size: spec.tunnel_pool_size,
        connection_worker_pool_size: spec.worker_pool_size,
        data_root_directory: data_dir.display().to_string(),
    };
    serde_json::to_string_pretty(&config).context("serialize tunnel client config")
}

#[async_trait]
impl TunnelClient for ProcessTunnelClient {
    async fn establish(&self, spec: &WorkerSpec) -> Result<Box<dyn TunnelSession>> {
        let connect_error = |e: anyhow::Error| GateError::WorkerConnect {
            port: spec.local_port,
            reason: format!("{:#}", e),
        };

        let mut child = self.spawn(spec).await.map_err(connect_error)?;

        if let Err(e) = self.wait_ready(&mut child, spec.local_port).await {
            let _ = child.kill().await;
            return Err(connect_error(e));
        }

        info!(
            "Tunnel client for {} listening on 127.0.0.1:{}",
            spec.authorization, spec.local_port
        );
        Ok(Box::new(ProcessSession {
            child,
            port: spec.local_port,
        }))
    }
}

/// A running tunnel-core child
struct ProcessSession {
    child: Child,
    port: u16,
}

#[async_trait]
impl TunnelSession for ProcessSession {
    async fn closed(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        Err(GateError::WorkerConnect {
            port: self.port,
            reason: format!("tunnel client exited ({})", status),
        })
    }

    async fn terminate(&mut self) {
        // kill() also reaps the child
        if let Err(e) = self.child.kill().await {
            debug!("Tunnel client on port {} already gone: {}", self.port, e);
        }
    }
}
