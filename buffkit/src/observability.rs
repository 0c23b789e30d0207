//! Tracing initialisation

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initialize tracing from configuration.
///
/// Safe to call once per process; later calls are ignored so tests that
/// each construct a kit do not fight over the global subscriber.
pub fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_ok() {
        tracing::info!(dev_mode = config.dev_mode, "buffkit tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = Config::default();
        init_tracing(&config);
        // Second call must not panic.
        init_tracing(&config);
    }
}
