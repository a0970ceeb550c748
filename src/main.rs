//! frontgate - Entry Point
//!
//! Starts the rotator, tunnel workers and gateway, and shuts them down
//! in order on Ctrl+C or SIGTERM.

use frontgate::shutdown::shutdown_signal;
use frontgate::{logging, App, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.log)?;

    info!(
        "Starting frontgate - rotator {}, gateway {}",
        config.rotator_addr(),
        config.gateway_addr()
    );

    let app = match App::start(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(fatal = e.is_fatal(), "Startup failed: {}", e);
            return Err(e.into());
        }
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    app.shutdown().await;
    Ok(())
}
