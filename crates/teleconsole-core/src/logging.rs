//! Tracing integration for structured logging.
//!
//! Verbosity is driven by the CLI's counted `-v` flag; `RUST_LOG` and the
//! debug environment variable override it.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::DEBUG_ENV_VAR;
use crate::Result;

/// Initialize the logging system.
///
/// Verbosity mapping: 0=error, 1=info, 2=debug, 3+=trace. Output goes to
/// stderr so it never mixes with the shared terminal's byte stream.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let level = if std::env::var(DEBUG_ENV_VAR).is_ok() && verbosity < 2 {
        "debug"
    } else {
        level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "teleconsole={level},teleconsole_core={level},teleconsole_client={level},russh=warn"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 2)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;

    Ok(())
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (logging may already be initialized).
pub fn init_test_logging() {
    let _ = init_logging(2);
}
