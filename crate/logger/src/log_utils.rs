//! Logging setup for the provider crates.
//!
//! Library code only emits `tracing` events; binaries and tests call [`log_init`]
//! once to install a subscriber.

use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "info";

/// Install the global tracing subscriber.
///
/// The filter is read from `RUST_LOG` when it is set, otherwise from
/// `default_value` (or `info` when none is given). Calling this more than once is a
/// no-op, so every test can call it.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_value.unwrap_or(DEFAULT_FILTER).to_owned());
        tracing_setup(&filter);
    });
}

fn tracing_setup(filter: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    // another subscriber may already be installed by the embedding application
    drop(
        tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(format)
            .try_init(),
    );
}

#[cfg(test)]
mod tests {
    use super::{info, log_init};

    #[test]
    fn log_init_is_idempotent() {
        log_init(Some("debug"));
        log_init(None);
        info!("logger initialized twice without panicking");
    }
}
