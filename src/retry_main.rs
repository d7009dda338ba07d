//! # Rollcall Dead-Letter Retry Daemon
//!
//! Declares the broker topology, then periodically redrives every
//! `*.dlq` queue back to the primary exchange under its original routing key.
//! Run exactly one of these per broker; scheduler daemons never touch
//! dead-letter queues.
//!
//! Usage:
//!   rollcall-retry            # loop every retry.retry_interval_seconds
//!   rollcall-retry --once     # single drain pass, then exit

mod common;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rollcall_broker::{AmqpBroker, RetryDaemon, Topology};
use rollcall_core::backoff::Backoff;

#[derive(Parser)]
#[command(
    name = "rollcall-retry",
    version,
    about = "♻️ Rollcall Retry: redrives dead-lettered events to their original destination"
)]
struct Cli {
    /// Config file (default: ~/.rollcall/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Drain every dead-letter queue once and exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = common::load_config(cli.config.as_deref())?;
    common::init_logging(&config.log, cli.verbose);

    let topology = Topology::from_config(&config.broker, &config.retry.queues);
    let broker = Arc::new(
        AmqpBroker::new(&config.broker_connection, &config.broker.exchange)?
            .with_operation_timeout(config.broker.operation_timeout()),
    );
    let cancel = common::cancel_on_shutdown_signal();

    // Broker may still be starting; keep trying unless this is a one-shot run.
    let mut backoff = Backoff::default();
    loop {
        match broker.declare_topology(&topology).await {
            Ok(()) => break,
            Err(e) if cli.once => return Err(e.into()),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!("⚠️ Topology declaration failed, retrying in {delay:?}: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let daemon = RetryDaemon::new(broker.clone(), topology.dead_letter_queues())
        .with_max_messages_per_queue(config.retry.max_messages_per_queue);

    if cli.once {
        let stats = daemon.run_once().await;
        tracing::info!(
            "✅ Single pass done: republished={} requeued={} failed_queues={}",
            stats.republished,
            stats.requeued,
            stats.failed_queues
        );
    } else {
        daemon.run(config.retry.retry_interval(), cancel).await;
    }

    broker.close().await;
    Ok(())
}
