//! Utility modules: environment, logging, signals, time

pub mod env;
pub mod logging;
pub mod signal;
pub mod time;

pub use env::{env_flag, env_int, env_opt, env_or_default};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config, init_test_logging};
pub use signal::{cancel_on_signal, wait_for_shutdown_signal};
pub use time::{current_block_time, current_timestamp};
