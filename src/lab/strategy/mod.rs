//! Scheduling strategies.
//!
//! A strategy answers three questions for the controlled scheduler: which
//! enabled operation runs next, and what each nondeterministic boolean or
//! integer choice resolves to. `prepare_for_next_iteration` advances the
//! strategy's own state between schedules; returning false means the
//! strategy has exhausted its search space.
//!
//! All strategies own a [`DetRng`] seeded from the test configuration, so a
//! seed fully determines the exploration.

pub mod dfs;
pub mod pct;
pub mod portfolio;
pub mod random;
pub mod replay;

pub use dfs::DfsStrategy;
pub use pct::PctStrategy;
pub use portfolio::PortfolioStrategy;
pub use random::{ProbabilisticStrategy, RandomStrategy};
pub use replay::ReplayStrategy;

use crate::config::{StrategyKind, TestConfig};
use crate::error::{Failure, Result};
use crate::lab::operation::{OpId, SchedulableOp};

/// A pluggable scheduling policy.
pub trait SchedulingStrategy: Send {
    /// Short name, recorded in traces.
    fn name(&self) -> &'static str;

    /// Picks the next operation to run.
    ///
    /// `Ok(None)` ends the iteration without a bug (e.g. a replay trace ran
    /// out). `Err` is a fatal inconsistency (replay divergence).
    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        current: Option<OpId>,
    ) -> Result<Option<OpId>>;

    /// Resolves a boolean choice: true with probability `1/max` (strategy
    /// permitting).
    fn next_boolean(&mut self, max: u32) -> Result<bool>;

    /// Resolves an integer choice in `[0, max)`.
    fn next_integer(&mut self, max: u32) -> Result<i32>;

    /// Advances to the next iteration. False means exhausted.
    fn prepare_for_next_iteration(&mut self) -> bool;
}

/// Builds the strategy selected by `config`.
pub fn build_strategy(config: &TestConfig) -> Result<Box<dyn SchedulingStrategy>> {
    Ok(match &config.strategy {
        StrategyKind::Random => Box::new(RandomStrategy::new(config.seed)),
        StrategyKind::Probabilistic => Box::new(ProbabilisticStrategy::new(config.seed)),
        StrategyKind::Pct { depth } => {
            Box::new(PctStrategy::new(config.seed, *depth, config.max_steps, false))
        }
        StrategyKind::FairPct { depth } => {
            Box::new(PctStrategy::new(config.seed, *depth, config.max_steps, true))
        }
        StrategyKind::Dfs => Box::new(DfsStrategy::new(None)),
        StrategyKind::Iddfs => Box::new(DfsStrategy::new(Some(16))),
        StrategyKind::Portfolio => Box::new(PortfolioStrategy::standard(
            config.seed,
            config.max_steps,
        )),
        StrategyKind::Replay => {
            let trace = config.replay_trace.clone().ok_or_else(|| {
                Failure::assertion("replay strategy requires a recorded trace")
            })?;
            Box::new(ReplayStrategy::new(trace))
        }
    })
}
