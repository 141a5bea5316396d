//! Small helpers shared by the binaries.

use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

/// Anything that stops a binary from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("redis unavailable: {0}")]
    Registry(#[from] RegistryError),
    #[error("kafka unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Bind `addr` and serve `app` on it until `stop` fires.
pub async fn serve(
    name: &'static str,
    addr: &str,
    app: Router,
    stop: CancellationToken,
) -> Result<JoinHandle<()>, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(listener = name, addr = %addr, "Listening");

    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await;
        if let Err(e) = served {
            error!(listener = name, error = %e, "Server error");
        }
    }))
}

/// Wait for `servers` to finish draining, at most `grace`.
pub async fn join_servers(servers: Vec<JoinHandle<()>>, grace: Duration) {
    let drained = tokio::time::timeout(grace, futures::future::join_all(servers)).await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "Listeners did not drain in time");
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves once SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Unable to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Name other replicas reach this one by: the override when set, else the
/// first address the system hostname resolves to, else the hostname itself.
pub async fn replica_hostname(configured: Option<&str>) -> String {
    if let Some(name) = configured.filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let hostname = match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "Unable to read hostname");
            return "localhost".to_string();
        }
    };

    let resolved = tokio::net::lookup_host((hostname.as_str(), 0))
        .await
        .map(|mut addrs| addrs.next());
    match resolved {
        Ok(first) => match first {
            Some(addr) => addr.ip().to_string(),
            None => hostname,
        },
        Err(e) => {
            warn!(hostname = %hostname, error = %e, "Unable to resolve hostname, using it as is");
            hostname
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_hostname_wins() {
        assert_eq!(replica_hostname(Some("10.1.2.3")).await, "10.1.2.3");
    }

    #[tokio::test]
    async fn test_hostname_fallback_not_empty() {
        assert!(!replica_hostname(Some("")).await.is_empty());
    }
}
