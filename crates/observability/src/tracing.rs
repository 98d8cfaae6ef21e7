//! Subscriber construction.
//!
//! Every entry point reads `RUST_LOG` first and falls back to the given
//! directive. Installing a second global subscriber fails silently, which is
//! what makes repeated calls harmless.

use tracing_subscriber::EnvFilter;

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// JSON logs with timestamps and span context.
pub fn init(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init();
}

/// Compact single-line logs written through libtest's captured writer.
pub fn init_for_tests(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .compact()
        .with_test_writer()
        .try_init();
}
