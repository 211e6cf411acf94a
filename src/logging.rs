//! Logger setup

use env_logger::Env;

/// Initialize env_logger on stderr (reads RUST_LOG, defaults to info).
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let result = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();

    if result.is_ok() {
        log::debug!("Logger initialized");
    }
}
