//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; embedding programs call
//! [`init`] once to see them. `RUST_LOG` overrides the level passed in.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a compact fmt subscriber writing to stderr.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("reclaim={}", level.as_str().to_lowercase())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .compact(),
        )
        .try_init();
}
