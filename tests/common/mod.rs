use threadmpi::{Config, Universe};
use tracing_subscriber::EnvFilter;

/// Sends runtime events to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn universe(size: usize) -> Universe {
    init_tracing();
    Universe::new(Config::new(size)).unwrap()
}
