//! Random and probabilistic strategies.

use crate::error::Result;
use crate::lab::operation::{OpId, SchedulableOp};
use crate::lab::strategy::SchedulingStrategy;
use crate::util::DetRng;

/// Uniform random choice among enabled operations.
///
/// Each iteration reseeds from `base_seed + iteration`, so a seed and an
/// iteration index identify a schedule.
#[derive(Debug)]
pub struct RandomStrategy {
    base_seed: u64,
    iteration: u64,
    rng: DetRng,
}

impl RandomStrategy {
    /// Creates the strategy with a base seed.
    #[must_use]
    pub fn new(base_seed: u64) -> Self {
        Self {
            base_seed,
            iteration: 0,
            rng: DetRng::new(base_seed),
        }
    }
}

impl SchedulingStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        _current: Option<OpId>,
    ) -> Result<Option<OpId>> {
        if enabled.is_empty() {
            return Ok(None);
        }
        let index = self.rng.next_usize(enabled.len());
        Ok(Some(enabled[index].op))
    }

    fn next_boolean(&mut self, max: u32) -> Result<bool> {
        Ok(self.rng.next_bool(max))
    }

    fn next_integer(&mut self, max: u32) -> Result<i32> {
        Ok(i32::try_from(self.rng.next_bounded_u32(max.max(1))).unwrap_or(i32::MAX))
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.iteration += 1;
        self.rng = DetRng::new(self.base_seed.wrapping_add(self.iteration));
        true
    }
}

/// Sticky random: keeps the current operation with high probability.
///
/// Long runs of one machine expose different interleavings than uniform
/// switching; the denominator controls the switch rate.
#[derive(Debug)]
pub struct ProbabilisticStrategy {
    base_seed: u64,
    iteration: u64,
    rng: DetRng,
    switch_denominator: u32,
}

impl ProbabilisticStrategy {
    /// Creates the strategy; switches with probability 1/4 per point.
    #[must_use]
    pub fn new(base_seed: u64) -> Self {
        Self {
            base_seed,
            iteration: 0,
            rng: DetRng::new(base_seed),
            switch_denominator: 4,
        }
    }
}

impl SchedulingStrategy for ProbabilisticStrategy {
    fn name(&self) -> &'static str {
        "probabilistic"
    }

    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        current: Option<OpId>,
    ) -> Result<Option<OpId>> {
        if enabled.is_empty() {
            return Ok(None);
        }
        if let Some(current) = current {
            let current_enabled = enabled.iter().any(|op| op.op == current);
            if current_enabled && !self.rng.next_bool(self.switch_denominator) {
                return Ok(Some(current));
            }
        }
        let index = self.rng.next_usize(enabled.len());
        Ok(Some(enabled[index].op))
    }

    fn next_boolean(&mut self, max: u32) -> Result<bool> {
        Ok(self.rng.next_bool(max))
    }

    fn next_integer(&mut self, max: u32) -> Result<i32> {
        Ok(i32::try_from(self.rng.next_bounded_u32(max.max(1))).unwrap_or(i32::MAX))
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.iteration += 1;
        self.rng = DetRng::new(self.base_seed.wrapping_add(self.iteration));
        true
    }
}
