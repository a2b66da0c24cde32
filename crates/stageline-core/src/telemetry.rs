//! Diagnostic logging for stageline.
//!
//! Stage output and run reports own stdout, so every diagnostic line is
//! written to stderr. `RUST_LOG` overrides the verbosity chosen on the
//! command line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Shape of the diagnostic lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, for CI log collectors.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn fallback_filter(level: Level) -> EnvFilter {
    EnvFilter::new(level.as_str())
}

/// Install the process-wide subscriber. Returns `false` when one was
/// already installed, in which case the existing one stays in place.
pub fn init_tracing(format: LogFormat, level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback_filter(level));
    let lines = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(lines.json())
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(lines)
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_flag_selects_format() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Text);
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn test_fallback_filter_uses_level() {
        assert_eq!(fallback_filter(Level::DEBUG).to_string(), "debug");
        assert_eq!(fallback_filter(Level::WARN).to_string(), "warn");
    }

    #[test]
    fn test_second_install_is_refused() {
        init_tracing(LogFormat::Text, Level::INFO);
        assert!(!init_tracing(LogFormat::Json, Level::DEBUG));
    }
}
