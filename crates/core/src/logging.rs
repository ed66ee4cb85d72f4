//! Logging initialization using tracing.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the logging system.
///
/// Uses the `RUST_LOG` environment variable when set, otherwise logs the
/// backend crates at debug level. Thread ids are included so output from
/// encoding worker threads can be told apart.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,maprender=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();
}
