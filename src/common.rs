//! Startup plumbing shared by both daemon binaries.

use std::path::Path;

use anyhow::Result;
use rollcall_core::config::{LogConfig, RollcallConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const VERBOSE_FILTER: &str =
    "info,rollcall=debug,rollcall_core=debug,rollcall_broker=debug,rollcall_scheduler=debug";

/// Load the config file (or defaults), apply env overrides, validate.
pub fn load_config(path: Option<&str>) -> Result<RollcallConfig> {
    let mut config = match path {
        Some(p) => RollcallConfig::load_from(Path::new(&*shellexpand::tilde(p)))?,
        None => RollcallConfig::load()?,
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over `-v`, which wins over `[log].filter`.
pub fn init_logging(log: &LogConfig, verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { log.filter.as_str() };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Token cancelled on SIGINT or SIGTERM.
pub fn cancel_on_shutdown_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("🛑 Shutdown signal received, finishing current batch");
        token.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
