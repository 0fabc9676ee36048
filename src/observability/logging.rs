//! Logging initialization.
//!
//! Structured logging via `tracing`, written to stderr so it never mixes
//! with protocol traffic. `TOOLGATE_LOG` overrides the verbosity flags when
//! set (standard `env-filter` directives).

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, colored when stderr is a terminal.
    #[default]
    Human,
    /// Newline-delimited JSON.
    Json,
}

/// Initializes the global tracing subscriber.
///
/// Verbosity mapping when `TOOLGATE_LOG` is unset: 0 → warn, 1 → info,
/// 2 → debug, 3+ → trace. Uses `try_init()` so repeated calls (tests) are
/// harmless.
pub fn init_logging(format: LogFormat, verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("TOOLGATE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let show_target = verbosity >= 2;

    match format {
        LogFormat::Human => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_human() {
        assert_eq!(LogFormat::default(), LogFormat::Human);
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(LogFormat::Human, 0);
        init_logging(LogFormat::Json, 3);
    }
}
