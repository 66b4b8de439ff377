//! Process-wide tracing setup shared by binaries and tests.

/// Initialize structured logging for the process.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init();
}

/// Initialize logging for tests: human-readable output captured per test.
pub fn init_for_tests() {
    subscriber::init_for_tests();
}

/// Subscriber construction (filters, formatting).
pub mod subscriber;
