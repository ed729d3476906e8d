//! Global `tracing` subscriber setup. Every initializer returns false instead
//! of panicking when a subscriber is already installed.

use tracing_subscriber::EnvFilter;

fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging for development (human-readable format)
pub fn init_dev_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter_or("mpctl_transport=debug,info"))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

/// Initialize logging for production (JSON format)
pub fn init_prod_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter_or("info"))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .json()
        .try_init()
        .is_ok()
}

/// Initialize logging with custom filter
pub fn init_logging_with_filter(filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}
