#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # connection_cleaner
//!
//! One pass over every connection claimed in Redis, removing the ones whose
//! owning replica is no longer in the headless service's DNS roster.

use clap::Parser;
use tracing::{error, info, warn};

use receptor_gateway::config::Config;
use receptor_gateway::dns::{DnsResolver, PodResolver};
use receptor_gateway::metrics;
use receptor_gateway::registry::{GlobalRegistry, RedisRegistry};
use receptor_gateway::util;

/// Remove Redis connection entries owned by replicas that are gone.
#[derive(Parser)]
#[command(name = "connection_cleaner", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// DNS name of the internal gateway service.
    #[arg(long, default_value = "receptor-gateway-internal")]
    pod_name: String,
    /// Only report stale connections, change nothing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Sweep {
    scanned: usize,
    stale: usize,
    /// Stale index entries whose claim now names another replica.
    moved: usize,
    removed: usize,
}

async fn sweep(
    global: &dyn GlobalRegistry,
    resolver: &dyn PodResolver,
    dry_run: bool,
) -> Result<Sweep, Box<dyn std::error::Error>> {
    let running = resolver.pods().await?;
    info!(pods = ?running, "Running pods");

    let all = global.get_all().await?;
    let mut result = Sweep::default();
    for (account, nodes) in &all {
        for (node_id, hostname) in nodes {
            result.scanned += 1;
            if running.contains(hostname) {
                continue;
            }
            result.stale += 1;
            warn!(account = %account, node_id = %node_id, hostname = %hostname, "Owner is down, entry is stale");
            if dry_run {
                continue;
            }
            match global.get(account, node_id).await {
                Ok(Some(owner)) if owner != *hostname => {
                    info!(account = %account, node_id = %node_id, owner = %owner, "Claim moved to another replica, keeping it");
                    result.moved += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(account = %account, node_id = %node_id, error = %e, "Unable to read claim");
                    continue;
                }
            }
            match global.unregister(account, node_id, hostname).await {
                Ok(()) => {
                    metrics::stale_connection_unregistered();
                    result.removed += 1;
                }
                Err(e) => error!(account = %account, node_id = %node_id, error = %e, "Unable to remove stale entry"),
            }
        }
    }
    Ok(result)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("connection_cleaner: {e}");
            std::process::exit(1);
        }
    };
    util::init_tracing(&config.logging.level);
    info!(pod_name = %cli.pod_name, dry_run = cli.dry_run, "Starting connection cleaner");

    let global = match RedisRegistry::connect(&config.redis).await {
        Ok(global) => global,
        Err(e) => {
            error!(error = %e, "Unable to connect to redis");
            std::process::exit(1);
        }
    };
    let resolver = DnsResolver::new(cli.pod_name);

    match sweep(&global, &resolver, cli.dry_run).await {
        Ok(result) => info!(
            scanned = result.scanned,
            stale = result.stale,
            moved = result.moved,
            removed = result.removed,
            "Sweep complete"
        ),
        Err(e) => {
            error!(error = %e, "Sweep failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use receptor_gateway::dns::StaticResolver;
    use receptor_gateway::registry::MemoryRegistry;

    async fn seeded() -> MemoryRegistry {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "10.0.0.1").await.unwrap();
        global.register("01", "node-b", "10.0.0.9").await.unwrap();
        global.register("02", "node-c", "10.0.0.9").await.unwrap();
        global
    }

    #[tokio::test]
    async fn test_removes_entries_of_missing_pods() {
        let global = seeded().await;
        let resolver = StaticResolver::new(["10.0.0.1", "10.0.0.2"]);

        let result = sweep(&global, &resolver, false).await.unwrap();
        assert_eq!(
            result,
            Sweep {
                scanned: 3,
                stale: 2,
                moved: 0,
                removed: 2
            }
        );
        assert_eq!(global.get("01", "node-a").await.unwrap().as_deref(), Some("10.0.0.1"));
        assert!(global.get("01", "node-b").await.unwrap().is_none());
        assert!(global.get("02", "node-c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let global = seeded().await;
        let resolver = StaticResolver::new(["10.0.0.1"]);

        let result = sweep(&global, &resolver, true).await.unwrap();
        assert_eq!(result.stale, 2);
        assert_eq!(result.removed, 0);
        assert!(global.get("01", "node-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_claim_survives_leftover_index_entry() {
        let global = MemoryRegistry::new();
        global.register("01", "node-a", "10.0.0.9").await.unwrap();
        // Drops the claim but leaves the 10.0.0.9 index members behind.
        global.unregister("01", "node-a", "10.0.0.1").await.unwrap();
        global.register("01", "node-a", "10.0.0.1").await.unwrap();
        assert_eq!(global.members("10.0.0.9"), vec!["01:node-a"]);

        let resolver = StaticResolver::new(["10.0.0.1"]);
        let result = sweep(&global, &resolver, false).await.unwrap();
        assert_eq!(result.removed, 0);
        assert_eq!(global.get("01", "node-a").await.unwrap().as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_dns_failure_aborts() {
        let global = seeded().await;
        let resolver = StaticResolver::new(["10.0.0.1"]);
        resolver.set_failing(true);

        assert!(sweep(&global, &resolver, false).await.is_err());
        assert!(global.get("01", "node-b").await.unwrap().is_some());
    }
}
