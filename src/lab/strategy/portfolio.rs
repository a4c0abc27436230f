//! Portfolio strategy: rotate through several strategies, one per
//! iteration. A portfolio hedges: random finds shallow races fast, PCT
//! finds deep ordering bugs, the probabilistic walker finds starvation
//! shapes.

use crate::error::Result;
use crate::lab::operation::{OpId, SchedulableOp};
use crate::lab::strategy::{
    PctStrategy, ProbabilisticStrategy, RandomStrategy, SchedulingStrategy,
};

/// Rotates through member strategies per iteration.
pub struct PortfolioStrategy {
    members: Vec<Box<dyn SchedulingStrategy>>,
    active: usize,
}

impl PortfolioStrategy {
    /// The standard portfolio: random, PCT(3), fair PCT(3), probabilistic.
    #[must_use]
    pub fn standard(seed: u64, max_steps: u32) -> Self {
        Self::new(vec![
            Box::new(RandomStrategy::new(seed)),
            Box::new(PctStrategy::new(seed ^ 0x9e37, 3, max_steps, false)),
            Box::new(PctStrategy::new(seed ^ 0x79b9, 3, max_steps, true)),
            Box::new(ProbabilisticStrategy::new(seed ^ 0x7f4a)),
        ])
    }

    /// Builds a portfolio from explicit members.
    ///
    /// # Panics
    ///
    /// Panics if `members` is empty.
    #[must_use]
    pub fn new(members: Vec<Box<dyn SchedulingStrategy>>) -> Self {
        assert!(!members.is_empty(), "portfolio needs at least one member");
        Self { members, active: 0 }
    }

    fn active_member(&mut self) -> &mut dyn SchedulingStrategy {
        self.members[self.active].as_mut()
    }
}

impl SchedulingStrategy for PortfolioStrategy {
    fn name(&self) -> &'static str {
        "portfolio"
    }

    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        current: Option<OpId>,
    ) -> Result<Option<OpId>> {
        self.active_member().next_operation(enabled, current)
    }

    fn next_boolean(&mut self, max: u32) -> Result<bool> {
        self.active_member().next_boolean(max)
    }

    fn next_integer(&mut self, max: u32) -> Result<i32> {
        self.active_member().next_integer(max)
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.active = (self.active + 1) % self.members.len();
        self.active_member().prepare_for_next_iteration()
    }
}

impl std::fmt::Debug for PortfolioStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PortfolioStrategy(active={}/{})",
            self.active,
            self.members.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompactMachineId;

    fn ops(n: u64) -> Vec<SchedulableOp> {
        (0..n)
            .map(|i| SchedulableOp {
                op: OpId(i),
                machine: CompactMachineId {
                    value: i,
                    generation: 1,
                },
            })
            .collect()
    }

    #[test]
    fn rotation_cycles_members() {
        let mut portfolio = PortfolioStrategy::standard(42, 100);
        let enabled = ops(2);
        for _ in 0..8 {
            assert!(portfolio.prepare_for_next_iteration());
            let chosen = portfolio.next_operation(&enabled, None).unwrap();
            assert!(chosen.is_some());
        }
    }

    #[test]
    fn never_exhausts() {
        let mut portfolio = PortfolioStrategy::standard(1, 10);
        for _ in 0..32 {
            assert!(portfolio.prepare_for_next_iteration());
        }
    }
}
