// Public modules
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod host;
pub mod registry;
pub mod sensors;
pub mod server;

// Re-export commonly used types
pub use config::{load_driver_config, DriverConfig};
pub use endpoint::{Endpoint, Session};
pub use errors::{EndpointError, RegistryError};
pub use host::fs::FsHost;
pub use registry::Registrar;
pub use sensors::Bh1750;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SESSION_POLL: Duration = Duration::from_millis(50);

/// Initialize tracing with default configuration
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Loads `<config_dir>/bh1750.toml`, falling back to the shipped defaults
/// when the file does not exist.
pub fn load_config_dir(config_dir: &str) -> Result<DriverConfig, errors::ConfigError> {
    let path = format!("{}/bh1750.toml", config_dir);
    if !Path::new(&path).exists() {
        info!("[config] {} not found, using defaults", path);
        return Ok(DriverConfig::default());
    }
    let config = load_driver_config(&path)?;
    info!("[config] loaded {}", path);
    Ok(config)
}

/// Registers the driver, serves its node until Ctrl-C, then tears it down.
pub async fn run_driver(config_dir: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("[luz] starting up...");

    let config = load_config_dir(config_dir)?;
    let host = Arc::new(FsHost::from_config(&config, Handle::current()));
    let registrar = Registrar::load(host, &config)?;
    info!("[luz] serving {}", registrar.node().path.display());

    tokio::signal::ctrl_c().await?;
    info!("[luz] shutting down");
    if registrar.endpoint().is_open() {
        info!("[luz] waiting for the open session to close");
        while registrar.endpoint().is_open() {
            tokio::time::sleep(SESSION_POLL).await;
        }
    }
    registrar.unload();
    Ok(())
}
