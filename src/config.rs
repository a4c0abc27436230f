//! Runtime and test configuration.
//!
//! Builder-style configs with chained setters. [`RuntimeConfig`] drives the
//! production backend; [`TestConfig`] drives the controlled testing backend
//! (iterations, step bounds, strategy selection, liveness options).

use crate::error::Failure;
use crate::lab::trace::ScheduleTrace;
use std::fmt;
use std::sync::Arc;

/// Callback invoked by the production runtime when an execution fails.
pub type FailureHook = Arc<dyn Fn(&Failure) + Send + Sync>;

/// Configuration for the production runtime.
#[derive(Clone, Default)]
pub struct RuntimeConfig {
    /// Seed for the runtime-scoped PRNG behind `random_bool`/`random_int`.
    pub seed: u64,
    /// Invoked once with the first failure that halts the runtime.
    pub on_failure: Option<FailureHook>,
    /// Count state visits and transitions.
    pub report_activity_coverage: bool,
}

impl RuntimeConfig {
    /// Creates a configuration with the given PRNG seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Installs a failure hook.
    #[must_use]
    pub fn on_failure(mut self, hook: FailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    /// Enables activity coverage counting.
    #[must_use]
    pub const fn report_activity_coverage(mut self, value: bool) -> Self {
        self.report_activity_coverage = value;
        self
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("seed", &self.seed)
            .field("on_failure", &self.on_failure.is_some())
            .field("report_activity_coverage", &self.report_activity_coverage)
            .finish()
    }
}

/// Which scheduling strategy the controlled backend uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    /// Uniform random choice among enabled operations.
    Random,
    /// Keep the current operation with high probability, switch otherwise.
    Probabilistic,
    /// Priority-bounded exploration with `depth` priority change points.
    Pct {
        /// Number of priority change points per iteration.
        depth: u32,
    },
    /// PCT with a round-robin fair tail after the change points are spent.
    FairPct {
        /// Number of priority change points per iteration.
        depth: u32,
    },
    /// Systematic depth-first enumeration of scheduling choices.
    Dfs,
    /// Depth-first with an iteratively deepening choice bound.
    Iddfs,
    /// Rotates through a portfolio of strategies, one per iteration.
    Portfolio,
    /// Replays a recorded schedule trace exactly.
    Replay,
}

impl StrategyKind {
    /// Short name used in traces and reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Probabilistic => "probabilistic",
            Self::Pct { .. } => "pct",
            Self::FairPct { .. } => "fair-pct",
            Self::Dfs => "dfs",
            Self::Iddfs => "iddfs",
            Self::Portfolio => "portfolio",
            Self::Replay => "replay",
        }
    }
}

/// Configuration for the controlled testing backend.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Strategy seed.
    pub seed: u64,
    /// Number of independent schedules to explore.
    pub iterations: u32,
    /// Per-iteration step bound.
    pub max_steps: u32,
    /// Strategy selection.
    pub strategy: StrategyKind,
    /// Enable the fingerprint cache of visited program states.
    pub cache_program_state: bool,
    /// Report a liveness bug when the program deadlocks with a hot monitor.
    pub liveness_checking: bool,
    /// Enable cycle-based liveness detection over fingerprints.
    pub cycle_detection: bool,
    /// Default value of the must-handle send option.
    pub must_handle_by_default: bool,
    /// Count state visits and transitions across iterations.
    pub report_activity_coverage: bool,
    /// Stop exploring after the first bug.
    pub stop_on_first_bug: bool,
    /// Trace to replay when `strategy` is [`StrategyKind::Replay`].
    pub replay_trace: Option<ScheduleTrace>,
}

impl TestConfig {
    /// Creates a configuration with the given seed and defaults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            iterations: 1,
            max_steps: 10_000,
            strategy: StrategyKind::Random,
            cache_program_state: false,
            liveness_checking: false,
            cycle_detection: false,
            must_handle_by_default: false,
            report_activity_coverage: false,
            stop_on_first_bug: true,
            replay_trace: None,
        }
    }

    /// Sets the number of iterations.
    #[must_use]
    pub const fn iterations(mut self, value: u32) -> Self {
        self.iterations = value;
        self
    }

    /// Sets the per-iteration step bound.
    #[must_use]
    pub const fn max_steps(mut self, value: u32) -> Self {
        self.max_steps = value;
        self
    }

    /// Selects the scheduling strategy.
    #[must_use]
    pub fn strategy(mut self, value: StrategyKind) -> Self {
        self.strategy = value;
        self
    }

    /// Enables the program-state fingerprint cache.
    #[must_use]
    pub const fn cache_program_state(mut self, value: bool) -> Self {
        self.cache_program_state = value;
        self
    }

    /// Enables deadlock-based liveness checking.
    #[must_use]
    pub const fn liveness_checking(mut self, value: bool) -> Self {
        self.liveness_checking = value;
        self
    }

    /// Enables cycle-based liveness detection (implies fingerprinting).
    #[must_use]
    pub const fn cycle_detection(mut self, value: bool) -> Self {
        self.cycle_detection = value;
        self
    }

    /// Makes sends must-handle unless overridden per send.
    #[must_use]
    pub const fn must_handle_by_default(mut self, value: bool) -> Self {
        self.must_handle_by_default = value;
        self
    }

    /// Enables activity coverage reporting.
    #[must_use]
    pub const fn report_activity_coverage(mut self, value: bool) -> Self {
        self.report_activity_coverage = value;
        self
    }

    /// Keep exploring after a bug is found.
    #[must_use]
    pub const fn continue_after_bug(mut self) -> Self {
        self.stop_on_first_bug = false;
        self
    }

    /// Configures replay of a recorded trace.
    #[must_use]
    pub fn replay(mut self, trace: ScheduleTrace) -> Self {
        self.strategy = StrategyKind::Replay;
        self.replay_trace = Some(trace);
        self
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
