//! Tracing output for tests
//!
//! Engine events (`retry attempt failed`, `circuit breaker opened`, ...) are
//! emitted through `tracing`. Call [`init_test_tracing`] at the top of a test
//! to see them; the filter comes from `RUST_LOG` and defaults to
//! `apiforge_common=debug`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "apiforge_common=debug";

/// Install a test-writer subscriber once per process
///
/// Later calls are no-ops, so every test can call this.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}
