//! Tracing/logging setup shared by binaries, tests and benches.

/// Initialize process-wide JSON logging filtered by `RUST_LOG` (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Human-readable logs routed through the test harness' capture.
///
/// Defaults to `warn` so passing tests stay quiet; set `RUST_LOG` to dig in.
pub fn init_for_tests() {
    tracing::init_for_tests("warn");
}

/// Subscriber construction (filters, formatters).
pub mod tracing;
