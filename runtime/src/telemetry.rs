//! Tracing setup.

use anyhow::Context;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};

/// Install a global subscriber: `RUST_LOG` if set, else `default_filter`.
///
/// # Errors
///
/// Fails when the filter does not parse or a global subscriber is already set.
///
/// # Example
///
/// ```no_run
/// use raxm_runtime::{config::RuntimeConfig, telemetry};
///
/// let config = RuntimeConfig::from_env()?;
/// telemetry::init_tracing(&config.log_filter)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter {default_filter:?}"))?,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(filter = default_filter, "Tracing initialized");
    Ok(())
}
