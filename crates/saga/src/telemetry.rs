//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{EngineConfig, LogFormat};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Calling this more
/// than once is harmless: later calls leave the first subscriber in place.
pub fn init(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_keeps_first_subscriber() {
        let config = EngineConfig::default();
        init(&config);
        init(&EngineConfig {
            log_format: LogFormat::Json,
            ..config
        });
        tracing::info!("subscriber installed");
    }
}
