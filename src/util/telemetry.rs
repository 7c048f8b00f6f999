//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "resilient_scheduler=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_FILTER);
}

/// Like [`init_tracing`] with an explicit fallback directive.
pub fn init_tracing_with(fallback: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
