//! Transparent proxy daemon (redsocks) integration
//!
//! Renders a config pointing redsocks at the Proxy Rotator with its
//! credentials, and starts and stops the daemon alongside the process.

use std::path::Path;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::config::RedsocksConfig;
use crate::error::{GateError, Result};

/// Where redsocks forwards redirected traffic
#[derive(Debug, Clone)]
pub struct RedsocksUpstream {
    pub ip: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

/// Manages one redsocks daemon
pub struct RedsocksService {
    config: RedsocksConfig,
    upstream: RedsocksUpstream,
    child: Mutex<Option<Child>>,
}

impl RedsocksService {
    pub fn new(config: RedsocksConfig, upstream: RedsocksUpstream) -> Self {
        Self {
            config,
            upstream,
            child: Mutex::new(None),
        }
    }

    /// Render the daemon configuration
    pub fn render_config(&self) -> String {
        format!(
            "base {{\n\
             \tlog_debug = off;\n\
             \tlog_info = on;\n\
             \tlog = \"file:{log}\";\n\
             \tdaemon = off;\n\
             \tredirector = iptables;\n\
             }}\n\
             \n\
             redsocks {{\n\
             \tlocal_ip = 0.0.0.0;\n\
             \tlocal_port = {local_port};\n\
             \tip = {ip};\n\
             \tport = {port};\n\
             \ttype = socks5;\n\
             \tlogin = \"{login}\";\n\
             \tpassword = \"{password}\";\n\
             }}\n",
            log = self.config.log_path.display(),
            local_port = self.config.local_port,
            ip = self.upstream.ip,
            port = self.upstream.port,
            login = self.upstream.login,
            password = self.upstream.password,
        )
    }

    /// Write the config file, creating parent directories.
    ///
    /// Permission failures become [`GateError::PermissionDenied`].
    pub async fn write_config(&self) -> Result<()> {
        let path = &self.config.config_path;
        create_parent(path).await?;
        create_parent(&self.config.log_path).await?;

        tokio::fs::write(path, self.render_config())
            .await
            .map_err(|e| GateError::from_write(path, e))?;

        debug!("Wrote redsocks config to {}", path.display());
        Ok(())
    }

    /// Export the config and launch the daemon.
    ///
    /// Only config export errors are returned; a daemon that cannot be
    /// launched is logged and skipped.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            debug!("Redsocks disabled");
            return Ok(());
        }

        self.write_config().await?;

        let mut slot = self.child.lock();
        if slot.is_some() {
            return Ok(());
        }

        match Command::new(&self.config.binary)
            .arg("-c")
            .arg(&self.config.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                info!(
                    "Redsocks started (pid {:?}) on port {} -> {}:{}",
                    child.id(),
                    self.config.local_port,
                    self.upstream.ip,
                    self.upstream.port
                );
                *slot = Some(child);
            }
            Err(e) => {
                warn!(
                    "Could not start {}: {} (transparent proxying disabled)",
                    self.config.binary.display(),
                    e
                );
            }
        }

        Ok(())
    }

    /// Stop the daemon if it runs; calling it again is a no-op
    pub async fn stop(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!("Redsocks already exited: {}", e);
            }
            info!("Redsocks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.lock().is_some()
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GateError::from_write(parent, e))?;
    }
    Ok(())
}
