//! Logging bootstrap

use anyhow::{Context, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Logging is set up at most once per process
static INIT: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` directives refine `log_level`;
/// calls after the first are no-ops.
pub fn init_logger(log_level: &str) -> Result<()> {
    let mut outcome = Ok(());

    INIT.call_once(|| {
        let level = parse_level(log_level);
        let env_filter = EnvFilter::from_default_env().add_directive(level.into());

        let terminal_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        outcome = tracing_subscriber::registry()
            .with(env_filter)
            .with(terminal_layer)
            .try_init()
            .context("failed to set global tracing subscriber");

        if outcome.is_ok() {
            tracing::debug!("Logging initialised at {}", level);
        }
    });

    outcome
}

/// Map a level name to a tracing level; unknown names mean info
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_repeated_init_is_noop() {
        init_logger("debug").unwrap();
        init_logger("trace").unwrap();
    }
}
