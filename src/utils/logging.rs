//! Tracing subscriber bootstrap

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_filter` when set. Safe to call
/// more than once: returns `false` when a global subscriber already exists.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}
