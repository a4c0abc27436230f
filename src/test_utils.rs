//! Shared helpers for tests.
//!
//! - consistent tracing-based logging initialization
//! - seeded engine and runtime constructors
//!
//! Available to unit tests, and to integration tests and benchmarks via
//! the `test-internals` feature.

use crate::config::{RuntimeConfig, TestConfig};
use crate::lab::TestEngine;
use crate::runtime::Runtime;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Default seed used by test helpers.
pub const DEFAULT_TEST_SEED: u64 = 0xDEAD_BEEF;

/// Initialize test logging with debug-level output.
///
/// Safe to call multiple times; only the first call initializes.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Creates a test engine with the default seed and one iteration.
#[must_use]
pub fn test_engine() -> TestEngine {
    TestEngine::new(TestConfig::new(DEFAULT_TEST_SEED)).expect("default config is valid")
}

/// Creates a test engine from an explicit configuration.
#[must_use]
pub fn test_engine_with(config: TestConfig) -> TestEngine {
    TestEngine::new(config).expect("config is valid")
}

/// Creates a production runtime with a deterministic seed.
#[must_use]
pub fn test_production_runtime() -> Runtime {
    Runtime::production(RuntimeConfig::new(DEFAULT_TEST_SEED))
}
