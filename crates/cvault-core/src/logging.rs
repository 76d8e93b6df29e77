//! Tracing subscriber bootstrap for applications embedding the vault.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install a global subscriber. `RUST_LOG` overrides `level` when set.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(level: &str, format: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .is_ok(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .is_ok(),
    }
}

pub fn init_from_config(config: &LoggingConfig) -> bool {
    init_logging(&config.level, &config.format)
}
