#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gateway
//!
//! Terminates long-lived receptor agent WebSockets and exposes the job and
//! management APIs for them.
//!
//! ## Listeners
//!
//! | Listener     | Default          | Routes                                           |
//! |--------------|------------------|--------------------------------------------------|
//! | agents       | `0.0.0.0:8080`   | `GET /wss/receptor-controller/gateway`           |
//! | management   | `0.0.0.0:9090`   | `/connection/*`, `POST /job`, `/openapi.json`    |
//! | monitoring   | `0.0.0.0:10000`  | `/liveness`, `/readiness`, `/metrics`            |
//!
//! With `gateway.registrar_impl = "redis"` every connection is also claimed
//! in Redis and watched by the active registrar; jobs for connections on
//! other replicas are proxied to their owner.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use receptor_gateway::config::{Config, RegistrarImpl};
use receptor_gateway::dns::DnsResolver;
use receptor_gateway::locator::{ConnectionLocator, LayeredLocator, LocalLocator, RedisLocator};
use receptor_gateway::proxy::ProxyFactory;
use receptor_gateway::queue::{KafkaProducer, ResponseBus};
use receptor_gateway::registrar::ActiveRegistrarFactory;
use receptor_gateway::registry::{GlobalRegistry, LocalRegistry, RedisRegistry, Registrar};
use receptor_gateway::state::{AppState, MonitoringState};
use receptor_gateway::util::{self, StartupError};
use receptor_gateway::ws::{self, GatewayState};
use receptor_gateway::{metrics, routes, Sessionlike};

/// Receptor agent gateway.
#[derive(Parser)]
#[command(name = "gateway", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gateway: {e}");
            std::process::exit(1);
        }
    };
    util::init_tracing(&config.logging.level);

    if let Err(e) = run(config).await {
        error!(error = %e, "Gateway failed to start");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let config = Arc::new(config);
    let metrics_handle = metrics::install()?;
    let hostname = util::replica_hostname(config.gateway.hostname.as_deref()).await;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %hostname,
        node_id = %config.websocket.node_id,
        registrar = ?config.gateway.registrar_impl,
        "Gateway starting"
    );

    let producer_stop = CancellationToken::new();
    let producer = Arc::new(KafkaProducer::start(&config.kafka, producer_stop.clone()).await?);
    let bus: Arc<dyn ResponseBus> = producer.clone();

    let local = LocalRegistry::new();
    let (registrar, locator): (Registrar, Arc<dyn ConnectionLocator>) =
        match config.gateway.registrar_impl {
            RegistrarImpl::Local => (
                Registrar::local_only(local.clone(), hostname.clone()),
                Arc::new(LocalLocator::new(local.clone())),
            ),
            RegistrarImpl::Redis => {
                let global: Arc<dyn GlobalRegistry> =
                    Arc::new(RedisRegistry::connect(&config.redis).await?);
                let active = ActiveRegistrarFactory::new(
                    global.clone(),
                    Arc::new(DnsResolver::new(config.gateway.cluster_service_name.clone())),
                    hostname.clone(),
                    config.gateway.poll_delay_bounds(),
                );
                let locator = LayeredLocator::new(
                    LocalLocator::new(local.clone()),
                    RedisLocator::new(global.clone(), ProxyFactory::new(&config.proxy)?),
                    hostname.clone(),
                );
                (
                    Registrar::with_global(local.clone(), global, active, hostname.clone()),
                    Arc::new(locator),
                )
            }
        };
    let registrar = Arc::new(registrar);

    let sessions = CancellationToken::new();
    let http_stop = CancellationToken::new();
    let monitoring = MonitoringState::new(Some(metrics_handle));

    let servers = vec![
        util::serve(
            "agents",
            &config.server.ws_listen,
            ws::router(GatewayState {
                config: config.clone(),
                registrar: registrar.clone(),
                bus,
                shutdown: sessions.clone(),
            }),
            http_stop.clone(),
        )
        .await?,
        util::serve(
            "management",
            &config.server.mgmt_listen,
            routes::management_router(AppState::new(config.clone(), locator)),
            http_stop.clone(),
        )
        .await?,
        util::serve(
            "monitoring",
            &config.server.monitoring_listen,
            routes::monitoring_router(monitoring.clone()),
            http_stop.clone(),
        )
        .await?,
    ];
    info!("Gateway ready");

    util::shutdown_signal().await;
    info!("Shutting down...");
    monitoring.set_ready(false);

    let grace = Duration::from_secs(config.server.http_shutdown_timeout_secs);
    close_sessions(&local, &sessions, grace).await;

    http_stop.cancel();
    util::join_servers(servers, grace).await;

    producer_stop.cancel();
    if tokio::time::timeout(grace, producer.stopped()).await.is_err() {
        error!("Response producer did not flush in time");
    }
    info!("Goodbye");
    Ok(())
}

/// Close every live session and wait for their disconnect handlers to
/// unregister them.
async fn close_sessions(local: &LocalRegistry, sessions: &CancellationToken, grace: Duration) {
    let live = local.get_all().await;
    let count: usize = live.values().map(|nodes| nodes.len()).sum();
    info!(count, "Closing agent connections");
    for session in live.values().flat_map(|nodes| nodes.values()) {
        let _ = session.close().await;
    }
    sessions.cancel();

    let drained = tokio::time::timeout(grace, async {
        while !local.get_all().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        error!("Connections still registered after the shutdown grace period");
    }
}
