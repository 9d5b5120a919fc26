//! Tracing subscriber setup.

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, events are
/// written as one JSON object per line.
///
/// # Errors
///
/// Returns an error if `level` is not a valid filter directive or a global
/// subscriber is already installed.
pub fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("failed to create log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .context("failed to install tracing subscriber")?;
    } else {
        registry
            .with(fmt::layer().compact().with_target(true).with_thread_ids(false))
            .try_init()
            .context("failed to install tracing subscriber")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        // Whichever test in the binary installs first wins; the next call must fail.
        let _ = init_logging("debug", false);
        assert!(init_logging("info", true).is_err());
    }
}
