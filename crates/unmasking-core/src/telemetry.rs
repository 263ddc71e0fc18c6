//! Tracing setup for unmasking binaries.
//!
//! Call [`init_tracing`] once at program start. When `RUST_LOG` is set
//! it wins outright; otherwise the requested level applies to the
//! unmasking crates only, with everything else held at `warn` so worker
//! and runtime internals stay quiet during long jobs.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for interactive runs.
    #[default]
    Text,
    /// Newline-delimited JSON for log aggregation pipelines.
    Json,
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("warn,unmasking_core={level},unmasking={level}")
}

/// Initialise the global tracing subscriber.
///
/// `level` is the verbosity applied to the unmasking crates when
/// `RUST_LOG` is unset. Safe to call more than once; only the first
/// call takes effect.
pub fn init_tracing(format: LogFormat, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false).json())
                .try_init()
                .ok();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .try_init()
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_verbosity_to_own_crates() {
        let directives = default_directives(Level::DEBUG);
        assert_eq!(directives, "warn,unmasking_core=debug,unmasking=debug");
        assert!(EnvFilter::builder().parse(&directives).is_ok());
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_tracing(LogFormat::Text, Level::INFO);
        init_tracing(LogFormat::Json, Level::DEBUG);
    }
}
