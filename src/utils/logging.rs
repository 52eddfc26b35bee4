//! Logging utilities
//!
//! Simple logging initialization that:
//! - Respects the RUST_LOG environment variable
//! - Allows a filter from the harness config file
//! - Optionally emits JSON for CI log collection
//!
//! # Usage
//! ```rust
//! use bllvm_harness::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// RUST_LOG wins, then the config filter, then `info`
fn build_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or("info"))
}

/// Initialize human-readable logging on stderr
///
/// # Arguments
/// * `filter` - Optional log filter from config (e.g., "info",
///   "bllvm_harness::network=debug"). RUST_LOG takes precedence.
pub fn init_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .with_ansi(std::env::var("NO_COLOR").is_err()), // Respect NO_COLOR
        )
        .with(build_filter(filter))
        .init();
}

/// Initialize logging with JSON output
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr),
        )
        .with(build_filter(filter))
        .init();
}

/// Initialize logging from the `[logging]` config section
pub fn init_logging_from_config(config: Option<&LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            // Fall back to regular logging if json-logging feature not enabled
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}

/// Logging for tests; safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_target(true))
        .with(build_filter(Some("warn")))
        .try_init();
}
