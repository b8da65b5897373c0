//! Process-wide `tracing` subscriber.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns false if a subscriber was already installed; the existing one is kept.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_names(true)
            .with_target(true);
        subscriber.with(json_layer).try_init().is_ok()
    } else {
        let pretty_layer = fmt::layer()
            .with_ansi(true)
            .with_thread_names(true)
            .with_target(true);
        subscriber.with(pretty_layer).try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_a_noop() {
        let config = LoggingConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
