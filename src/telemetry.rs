//! Log subscriber setup for the `conductor` binary.

use crate::config::{LogFormat, LoggingSection};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays clean.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(logging: &LoggingSection) -> bool {
    let filter = env_filter(&logging.level);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match logging.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        // Must not panic on garbage input
        let _ = env_filter("not a [valid] directive ===");
    }

    #[test]
    fn test_second_init_is_rejected() {
        let logging = LoggingSection::default();
        let _ = init(&logging);
        assert!(!init(&logging));
    }
}
