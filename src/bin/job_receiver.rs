#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # job_receiver
//!
//! Management and job API without any agent connections of its own. Every
//! connection is found through Redis and reached by proxying to the gateway
//! replica that owns it, so `proxy.client_id` and `proxy.psk` must be set.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use receptor_gateway::config::{Config, ConfigError};
use receptor_gateway::locator::RedisLocator;
use receptor_gateway::proxy::ProxyFactory;
use receptor_gateway::registry::{GlobalRegistry, RedisRegistry};
use receptor_gateway::state::{AppState, MonitoringState};
use receptor_gateway::util::{self, StartupError};
use receptor_gateway::{metrics, routes};

/// Job receiver for the receptor gateway fleet.
#[derive(Parser)]
#[command(name = "job_receiver", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Listen address, overriding `server.job_receiver_listen`.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("job_receiver: {e}");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        config.server.job_receiver_listen = listen;
    }
    util::init_tracing(&config.logging.level);

    if let Err(e) = run(config).await {
        error!(error = %e, "Job receiver failed to start");
        std::process::exit(1);
    }
}

fn verify(config: &Config) -> Result<(), ConfigError> {
    if config.proxy.client_id.is_empty() {
        return Err(ConfigError::Invalid("proxy client_id is not set".to_string()));
    }
    if config.proxy.psk.is_empty() {
        return Err(ConfigError::Invalid("proxy psk is not set".to_string()));
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), StartupError> {
    verify(&config)?;
    let config = Arc::new(config);
    let metrics_handle = metrics::install()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Job receiver starting");

    let global: Arc<dyn GlobalRegistry> = Arc::new(RedisRegistry::connect(&config.redis).await?);
    let locator = Arc::new(RedisLocator::new(global, ProxyFactory::new(&config.proxy)?));
    let monitoring = MonitoringState::new(Some(metrics_handle));

    let app = routes::management_router(AppState::new(config.clone(), locator))
        .merge(routes::monitoring_router(monitoring.clone()));

    let stop = CancellationToken::new();
    let server = util::serve("management", &config.server.job_receiver_listen, app, stop.clone()).await?;
    info!("Job receiver ready");

    util::shutdown_signal().await;
    info!("Shutting down...");
    monitoring.set_ready(false);
    stop.cancel();
    util::join_servers(
        vec![server],
        Duration::from_secs(config.server.http_shutdown_timeout_secs),
    )
    .await;
    info!("Goodbye");
    Ok(())
}
