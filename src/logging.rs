//! Tracing subscriber setup for the binary.
//!
//! Logs go to stderr so command output on stdout stays parseable.
//! `RUST_LOG` overrides the default filter.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Default filter: `info`, or `debug` for this crate when detailed
/// logging is on.
pub fn default_directives(detailed: bool) -> String {
    if detailed {
        "info,pipesync=debug,pipesync_core=debug".to_string()
    } else {
        "info".to_string()
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(detailed: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(detailed)));

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
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
    fn detailed_logging_raises_crate_level() {
        assert_eq!(default_directives(false), "info");
        assert!(default_directives(true).contains("pipesync=debug"));
        assert!(EnvFilter::try_new(default_directives(true)).is_ok());
    }
}
