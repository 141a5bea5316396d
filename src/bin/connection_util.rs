#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # connection_util
//!
//! Manual edits to the Redis connection registry.
//!
//! ```text
//! connection_util --action register   --account 01 --node-id node-a --hostname 10.0.0.1
//! connection_util --action unregister --account 01 --node-id node-a --hostname 10.0.0.1
//! connection_util --action list       --account 01 --node-id node-a
//! ```

use clap::{Parser, ValueEnum};
use tracing::error;

use receptor_gateway::config::Config;
use receptor_gateway::registry::{GlobalRegistry, RedisRegistry, RegistryError};
use receptor_gateway::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Action {
    Register,
    Unregister,
    List,
}

/// Register, unregister or look up a connection in Redis.
#[derive(Parser)]
#[command(name = "connection_util", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum, default_value = "register")]
    action: Action,
    /// Account number.
    #[arg(long, default_value = "")]
    account: String,
    #[arg(long, default_value = "")]
    node_id: String,
    /// Replica recorded as the owner.
    #[arg(long, default_value = "")]
    hostname: String,
}

impl Cli {
    /// Names of the flags `action` needs but did not get.
    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.account.is_empty() {
            missing.push("--account");
        }
        if self.node_id.is_empty() {
            missing.push("--node-id");
        }
        if self.action != Action::List && self.hostname.is_empty() {
            missing.push("--hostname");
        }
        missing
    }
}

/// Run `cli.action`, returning what to print.
async fn execute(cli: &Cli, global: &dyn GlobalRegistry) -> Result<String, RegistryError> {
    match cli.action {
        Action::Register => {
            global.register(&cli.account, &cli.node_id, &cli.hostname).await?;
            Ok(format!("registered {}:{} on {}", cli.account, cli.node_id, cli.hostname))
        }
        Action::Unregister => {
            global.unregister(&cli.account, &cli.node_id, &cli.hostname).await?;
            Ok(format!("unregistered {}:{} from {}", cli.account, cli.node_id, cli.hostname))
        }
        Action::List => Ok(global
            .get(&cli.account, &cli.node_id)
            .await?
            .unwrap_or_default()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("connection_util: {e}");
            std::process::exit(1);
        }
    };
    util::init_tracing(&config.logging.level);

    let missing = cli.missing();
    if !missing.is_empty() {
        eprintln!("connection_util: required parameters: {}", missing.join(", "));
        std::process::exit(2);
    }

    let global = match RedisRegistry::connect(&config.redis).await {
        Ok(global) => global,
        Err(e) => {
            error!(error = %e, "Unable to connect to redis");
            std::process::exit(1);
        }
    };

    match execute(&cli, &global).await {
        Ok(out) => println!("{out}"),
        Err(e) => {
            error!(error = %e, action = ?cli.action, "Action failed");
            std::process::exit(1);
        }
    }
}
