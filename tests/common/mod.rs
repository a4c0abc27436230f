//! Shared helpers for integration tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing output for tests. First call wins.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}
