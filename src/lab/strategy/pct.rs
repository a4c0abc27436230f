//! Priority-bounded exploration (PCT).
//!
//! Every operation gets a random priority on first sight; the scheduler
//! always runs the highest-priority enabled operation. At `depth` randomly
//! chosen step indices the running operation's priority drops below all
//! others, forcing a context switch at that point. This finds bugs of
//! "bug depth" ≤ depth with known probability.
//!
//! The fair variant falls back to round-robin once the change points are
//! spent, so starvation-prone programs still make progress and liveness
//! checks remain meaningful.

use crate::error::Result;
use crate::lab::operation::{OpId, SchedulableOp};
use crate::lab::strategy::SchedulingStrategy;
use crate::util::DetRng;
use std::collections::{BTreeSet, HashMap};

/// Priority-bounded strategy, optionally with a fair round-robin tail.
#[derive(Debug)]
pub struct PctStrategy {
    base_seed: u64,
    iteration: u64,
    rng: DetRng,
    depth: u32,
    max_steps: u32,
    fair: bool,
    priorities: HashMap<OpId, u64>,
    change_points: BTreeSet<u64>,
    next_low_priority: u64,
    steps: u64,
    round_robin_cursor: usize,
}

impl PctStrategy {
    /// Creates a PCT strategy with `depth` priority change points.
    #[must_use]
    pub fn new(base_seed: u64, depth: u32, max_steps: u32, fair: bool) -> Self {
        let mut strategy = Self {
            base_seed,
            iteration: 0,
            rng: DetRng::new(base_seed),
            depth,
            max_steps,
            fair,
            priorities: HashMap::new(),
            change_points: BTreeSet::new(),
            next_low_priority: 0,
            steps: 0,
            round_robin_cursor: 0,
        };
        strategy.reset_iteration();
        strategy
    }

    fn reset_iteration(&mut self) {
        self.priorities.clear();
        self.change_points.clear();
        self.steps = 0;
        self.round_robin_cursor = 0;
        self.next_low_priority = 0;
        let bound = u64::from(self.max_steps.max(1));
        while self.change_points.len() < self.depth as usize {
            self.change_points.insert(self.rng.next_u64() % bound);
            if self.change_points.len() >= bound as usize {
                break;
            }
        }
    }

    fn priority_of(&mut self, op: OpId) -> u64 {
        if let Some(priority) = self.priorities.get(&op) {
            return *priority;
        }
        // High random priorities; change points assign descending low ones,
        // so a deprioritized op sinks below everything seen so far.
        let priority = (self.rng.next_u64() >> 1) | (1 << 62);
        self.priorities.insert(op, priority);
        priority
    }

    fn in_fair_tail(&self) -> bool {
        self.fair && self.change_points.iter().all(|point| *point < self.steps)
    }
}

impl SchedulingStrategy for PctStrategy {
    fn name(&self) -> &'static str {
        if self.fair {
            "fair-pct"
        } else {
            "pct"
        }
    }

    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        current: Option<OpId>,
    ) -> Result<Option<OpId>> {
        if enabled.is_empty() {
            return Ok(None);
        }
        let step = self.steps;
        self.steps += 1;

        if self.in_fair_tail() {
            self.round_robin_cursor = (self.round_robin_cursor + 1) % enabled.len();
            return Ok(Some(enabled[self.round_robin_cursor].op));
        }

        if self.change_points.contains(&step) {
            if let Some(current) = current {
                // Sink the running operation below every other priority.
                self.next_low_priority = self.next_low_priority.saturating_sub(1);
                self.priorities.insert(current, self.next_low_priority);
            }
        }

        let mut best: Option<(u64, OpId)> = None;
        for candidate in enabled {
            let priority = self.priority_of(candidate.op);
            if best.is_none_or(|(best_priority, _)| priority > best_priority) {
                best = Some((priority, candidate.op));
            }
        }
        Ok(best.map(|(_, op)| op))
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
        self.reset_iteration();
        true
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
    fn highest_priority_wins_consistently() {
        let mut strategy = PctStrategy::new(3, 0, 100, false);
        let enabled = ops(4);
        let first = strategy.next_operation(&enabled, None).unwrap().unwrap();
        // With no change points the winner never changes.
        for _ in 0..16 {
            assert_eq!(
                strategy.next_operation(&enabled, Some(first)).unwrap(),
                Some(first)
            );
        }
    }

    #[test]
    fn change_points_force_switches() {
        let mut strategy = PctStrategy::new(5, 10, 20, false);
        let enabled = ops(3);
        let mut chosen = Vec::new();
        let mut current = None;
        for _ in 0..20 {
            let next = strategy.next_operation(&enabled, current).unwrap().unwrap();
            chosen.push(next);
            current = Some(next);
        }
        let distinct: std::collections::BTreeSet<_> = chosen.iter().collect();
        assert!(distinct.len() > 1, "change points should force a switch");
    }

    #[test]
    fn fair_tail_round_robins() {
        // depth 0 => every step is past the (empty) change points.
        let mut strategy = PctStrategy::new(1, 0, 10, true);
        let enabled = ops(3);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..6 {
            seen.insert(strategy.next_operation(&enabled, None).unwrap().unwrap());
        }
        assert_eq!(seen.len(), 3, "round-robin touches every op");
    }

    #[test]
    fn deterministic_per_seed() {
        let mut a = PctStrategy::new(9, 3, 50, false);
        let mut b = PctStrategy::new(9, 3, 50, false);
        let enabled = ops(4);
        for _ in 0..32 {
            assert_eq!(
                a.next_operation(&enabled, None).unwrap(),
                b.next_operation(&enabled, None).unwrap()
            );
        }
    }
}
