//! The test engine: iteration driver for the controlled backend.
//!
//! Runs a test entry function under `iterations` independent schedules.
//! Each iteration gets a fresh controlled runtime and scheduler; the
//! strategy persists across iterations and advances via
//! `prepare_for_next_iteration`. Bugs come back as [`BugReport`]s carrying
//! the failure, the step offset, and the full schedule trace in replayable
//! form.
//!
//! ```no_run
//! use machina::{TestConfig, TestEngine};
//!
//! let mut engine = TestEngine::new(TestConfig::new(42).iterations(100)).unwrap();
//! let report = engine.run(|rt| {
//!     // create machines, send events, assert properties
//!     let _ = rt;
//!     Ok(())
//! });
//! assert!(!report.found_bug(), "{report}");
//! ```

use crate::config::TestConfig;
use crate::coverage::CoverageReport;
use crate::error::{Failure, Result};
use crate::lab::runtime::{set_current_op, ControlledRuntime};
use crate::lab::scheduler::{
    ControlledScheduler, IterationOutcome, ProgramStateView, SchedulerConfig,
};
use crate::lab::strategy::{build_strategy, SchedulingStrategy};
use crate::lab::trace::ScheduleTrace;
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, info};
use crate::types::CompactMachineId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Number of recent fingerprints kept for cycle detection.
const FINGERPRINT_HISTORY: usize = 256;

/// A bug found during exploration, with its reproducer.
#[derive(Debug, Clone)]
pub struct BugReport {
    /// The failure.
    pub failure: Failure,
    /// Iteration index (0-based) that found it.
    pub iteration: u32,
    /// Schedule step at which it surfaced.
    pub step: u64,
    /// Full schedule trace, replayable via [`TestConfig::replay`].
    pub trace: ScheduleTrace,
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bug at iteration {} step {}: {}",
            self.iteration, self.step, self.failure
        )
    }
}

/// Result of a test run.
#[derive(Debug, Default)]
pub struct TestReport {
    /// Iterations actually executed.
    pub iterations_run: u32,
    /// Bugs found, in discovery order.
    pub bugs: Vec<BugReport>,
    /// Merged activity coverage, when enabled.
    pub coverage: Option<CoverageReport>,
    /// Iterations that hit the step bound.
    pub max_steps_hits: u32,
}

impl TestReport {
    /// True if any bug was found.
    #[must_use]
    pub fn found_bug(&self) -> bool {
        !self.bugs.is_empty()
    }

    /// The first bug found, if any.
    #[must_use]
    pub fn first_bug(&self) -> Option<&BugReport> {
        self.bugs.first()
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} iterations, {} bugs, {} step-bound hits",
            self.iterations_run,
            self.bugs.len(),
            self.max_steps_hits
        )?;
        for bug in &self.bugs {
            writeln!(f, "  {bug}")?;
        }
        if let Some(coverage) = &self.coverage {
            write!(f, "{coverage}")?;
        }
        Ok(())
    }
}

/// Explores schedules of a test program.
pub struct TestEngine {
    config: TestConfig,
    strategy: Arc<Mutex<Box<dyn SchedulingStrategy>>>,
}

impl TestEngine {
    /// Creates an engine for `config`. Fails if the configuration is
    /// inconsistent (e.g. replay without a trace).
    pub fn new(config: TestConfig) -> Result<Self> {
        let strategy = build_strategy(&config)?;
        Ok(Self {
            config,
            strategy: Arc::new(Mutex::new(strategy)),
        })
    }

    /// Runs `entry` under up to `iterations` schedules.
    ///
    /// The entry function is the test harness: it runs as its own
    /// scheduled operation, so its creates and sends interleave with
    /// machine execution under the strategy's control.
    pub fn run<F>(&mut self, entry: F) -> TestReport
    where
        F: Fn(&Runtime) -> Result<()>,
    {
        let mut report = TestReport::default();
        let mut coverage = CoverageReport::new();

        for iteration in 0..self.config.iterations {
            let outcome = self.run_iteration(iteration, &entry, &mut coverage, &mut report);
            report.iterations_run += 1;

            match outcome {
                IterationOutcome::BugFound { .. } if self.config.stop_on_first_bug => break,
                _ => {}
            }
            if !self.strategy.lock().prepare_for_next_iteration() {
                info!(iteration, "strategy exhausted its search space");
                break;
            }
        }

        if self.config.report_activity_coverage {
            report.coverage = Some(coverage);
        }
        report
    }

    fn run_iteration<F>(
        &self,
        iteration: u32,
        entry: &F,
        coverage: &mut CoverageReport,
        report: &mut TestReport,
    ) -> IterationOutcome
    where
        F: Fn(&Runtime) -> Result<()>,
    {
        debug!(iteration, "iteration start");
        let scheduler = Arc::new(ControlledScheduler::new(
            SchedulerConfig {
                max_steps: u64::from(self.config.max_steps),
                liveness_checking: self.config.liveness_checking,
                cycle_detection: self.config.cycle_detection,
                cache_program_state: self.config.cache_program_state,
                seed: self.config.seed,
                strategy_name: self.config.strategy.name(),
                fingerprint_history: FINGERPRINT_HISTORY,
            },
            self.strategy.clone(),
        ));
        let rt = ControlledRuntime::new_arc(
            self.config.clone(),
            scheduler.clone(),
            u64::from(iteration) + 1,
        );
        let rt_dyn: Arc<dyn ProgramStateView> = rt.clone();
        let view: Weak<dyn ProgramStateView> = Arc::downgrade(&rt_dyn);
        scheduler.set_view(view);

        // The harness is operation zero.
        let harness_id = rt.shared.ids.next("TestHarness", Some("harness"), None);
        let (harness_op, _gate) = scheduler.register_op(CompactMachineId::from(&harness_id));
        scheduler.start_with(harness_op);
        set_current_op(Some((harness_op, CompactMachineId::from(&harness_id))));

        let runtime = Runtime::from_core(rt.clone());
        let entry_result = entry(&runtime);

        match entry_result {
            Ok(()) => scheduler.complete(harness_op),
            Err(failure) if failure.is_canceled() => {}
            Err(failure) => scheduler.report_bug(failure),
        }

        let outcome = scheduler.await_completion();
        rt.join_threads();
        set_current_op(None);

        if self.config.report_activity_coverage {
            coverage.merge(&rt.shared.coverage_snapshot());
        }
        match &outcome {
            IterationOutcome::BugFound { failure, step } => {
                info!(iteration, step, %failure, "bug found");
                report.bugs.push(BugReport {
                    failure: failure.clone(),
                    iteration,
                    step: *step,
                    trace: scheduler.trace_snapshot(),
                });
            }
            IterationOutcome::MaxStepsReached { .. } => {
                report.max_steps_hits += 1;
            }
            IterationOutcome::Completed { .. } => {}
        }
        outcome
    }
}

impl fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEngine")
            .field("config", &self.config)
            .finish()
    }
}
