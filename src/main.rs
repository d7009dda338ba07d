//! # Rollcall Scheduler Daemon
//!
//! Publishes one schedule kind's due rows as broker events.
//!
//! Usage:
//!   rollcall-scheduler --kind reminders            # game.reminder_due
//!   rollcall-scheduler --kind status               # game.status_transition_due
//!   rollcall-scheduler --kind reminders --migrate  # apply schema first
//!
//! Run as many replicas per kind as needed; claims never overlap.

mod common;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rollcall_broker::{AmqpBroker, Publisher};
use rollcall_core::config::RollcallConfig;
use rollcall_scheduler::persistence::{connect_pool, migrate};
use rollcall_scheduler::{
    DaemonSettings, EventBuilder, GameReminders, GameStatusTransitions, PgDueStore,
    PgWakeChannel, ReminderEventBuilder, ScheduleTable, SchedulerDaemon,
    StatusTransitionEventBuilder,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    /// notification_schedule → game.reminder_due
    Reminders,
    /// game_status_schedule → game.status_transition_due
    Status,
}

#[derive(Parser)]
#[command(
    name = "rollcall-scheduler",
    version,
    about = "⏰ Rollcall Scheduler: wakes on schedule changes and publishes due items"
)]
struct Cli {
    /// Schedule kind to run
    #[arg(short, long, value_enum)]
    kind: Kind,

    /// Config file (default: ~/.rollcall/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Apply database migrations before starting
    #[arg(long)]
    migrate: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = common::load_config(cli.config.as_deref())?;
    common::init_logging(&config.log, cli.verbose);

    let pool = connect_pool(
        &config.store_connection,
        config.scheduler.max_connections,
        config.scheduler.store_timeout(),
    )?;
    if cli.migrate {
        migrate(&pool).await?;
        tracing::info!("🗄️ Migrations applied");
    }

    let broker = Arc::new(
        AmqpBroker::new(&config.broker_connection, &config.broker.exchange)?
            .with_publish_timeout(config.scheduler.publish_timeout())
            .with_operation_timeout(config.broker.operation_timeout()),
    );
    let cancel = common::cancel_on_shutdown_signal();

    match cli.kind {
        Kind::Reminders => {
            run_daemon::<GameReminders>(pool, broker.clone(), ReminderEventBuilder, &config, cancel)
                .await
        }
        Kind::Status => {
            run_daemon::<GameStatusTransitions>(
                pool,
                broker.clone(),
                StatusTransitionEventBuilder,
                &config,
                cancel,
            )
            .await
        }
    }

    broker.close().await;
    Ok(())
}

async fn run_daemon<T: ScheduleTable>(
    pool: PgPool,
    publisher: Arc<dyn Publisher>,
    builder: impl EventBuilder + 'static,
    config: &RollcallConfig,
    cancel: CancellationToken,
) {
    let channel = config
        .scheduler
        .wake_channel
        .clone()
        .unwrap_or_else(|| T::WAKE_CHANNEL.to_string());
    tracing::info!(
        "🚀 Starting {} daemon: table {} → {} (wake channel {channel})",
        T::KIND,
        T::TABLE,
        T::EVENT_TYPE
    );

    let wake = PgWakeChannel::subscribe(pool.clone(), &channel).await;
    let store = PgDueStore::<T>::new(pool);
    SchedulerDaemon::new(
        store,
        wake,
        publisher,
        builder,
        DaemonSettings::from(&config.scheduler),
    )
    .run(cancel)
    .await;
}
