//! Logging helpers
//!
//! Thin wrapper around `env_logger`; every other module logs through the `log` macros.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the logger
///
/// `RUST_LOG` takes precedence over `level`. Only the first call has an effect.
///
/// # Parameters
///
/// * `level` - Default log level (error, warn, info, debug, trace)
pub fn init_logger(level: &str) {
    INIT.call_once(|| {
        let env = env_logger::Env::default()
            .filter_or("RUST_LOG", level);

        // A test harness may already have installed a logger
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .try_init();
    });
}
