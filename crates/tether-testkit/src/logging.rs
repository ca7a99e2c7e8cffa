//! Test logging.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tether=debug";

/// Install a fmt subscriber writing through the test harness's capture.
///
/// Honors `RUST_LOG`, defaulting to `tether=debug`. Safe to call from every
/// test; only the first call installs anything.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
