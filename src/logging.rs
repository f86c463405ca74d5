//! Logging setup
//!
//! The library itself only emits `tracing` events; binaries and tests opt in
//! to output by installing a subscriber here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Install a stdout subscriber filtered at `level` (`RUST_LOG` overrides).
///
/// Only the first call in a process installs anything; later calls are
/// no-ops, so every test can call it freely.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| Error::Configuration {
            reason: format!("invalid log level '{level}': {e}"),
        })?,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(level = %level, "logging initialized");
    }
    Ok(())
}
