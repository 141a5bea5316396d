#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # response_consumer
//!
//! Tails the responses topic and prints every record. A debugging aid.

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use receptor_gateway::config::Config;
use receptor_gateway::queue;
use receptor_gateway::util;

/// Print records from the receptor responses topic.
#[derive(Parser)]
#[command(name = "response_consumer", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Topic to read, defaults to `kafka.responses_topic`.
    #[arg(long)]
    topic: Option<String>,
    /// Start offset: -1 latest, -2 earliest. Defaults to `kafka.consumer_offset`.
    #[arg(long, allow_hyphen_values = true)]
    offset: Option<i64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("response_consumer: {e}");
            std::process::exit(1);
        }
    };
    util::init_tracing(&config.logging.level);

    let topic = cli.topic.unwrap_or_else(|| config.kafka.responses_topic.clone());
    let offset = cli.offset.unwrap_or(config.kafka.consumer_offset);
    println!(
        "Kafka consumer config: brokers={:?} topic={topic} offset={offset}",
        config.kafka.brokers
    );

    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);
    let consumer = {
        let shutdown = shutdown.clone();
        let kafka = config.kafka.clone();
        tokio::spawn(async move { queue::consume_topic(&kafka, &topic, offset, tx, shutdown).await })
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            util::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    while let Some(record) = rx.recv().await {
        println!(
            "message at offset {}, partition {}: {} = {}",
            record.offset, record.partition, record.key, record.value
        );
    }

    match consumer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Consumer failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "Consumer task panicked");
            std::process::exit(1);
        }
    }
}
