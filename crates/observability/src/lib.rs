//! Process-wide logging setup shared by binaries and tests.

/// Initialize process-wide logging from the environment.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(&tracing::LogConfig::from_env());
}

/// Plain-text logging routed through the test harness's capture.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
