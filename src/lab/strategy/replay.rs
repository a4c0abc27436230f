//! Replay of a recorded schedule trace.
//!
//! Returns exactly the recorded choices and asserts that reality matches
//! the recording: a decision of the wrong kind, a chosen machine that is
//! not enabled, or choices past the end of the trace are all fatal
//! inconsistencies (the test harness is nondeterministic).

use crate::error::{Failure, Result};
use crate::lab::operation::{OpId, SchedulableOp};
use crate::lab::strategy::SchedulingStrategy;
use crate::lab::trace::{Decision, ScheduleTrace};

/// Strategy that replays a [`ScheduleTrace`].
#[derive(Debug)]
pub struct ReplayStrategy {
    trace: ScheduleTrace,
    cursor: usize,
    ran_once: bool,
}

impl ReplayStrategy {
    /// Creates a replay of `trace`.
    #[must_use]
    pub fn new(trace: ScheduleTrace) -> Self {
        Self {
            trace,
            cursor: 0,
            ran_once: false,
        }
    }

    fn step(&self) -> u64 {
        self.cursor as u64
    }

    fn next_decision(&mut self) -> Option<&Decision> {
        let decision = self.trace.decisions.get(self.cursor);
        if decision.is_some() {
            self.cursor += 1;
        }
        decision
    }
}

impl SchedulingStrategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn next_operation(
        &mut self,
        enabled: &[SchedulableOp],
        _current: Option<OpId>,
    ) -> Result<Option<OpId>> {
        let step = self.step();
        let Some(decision) = self.next_decision() else {
            // The recording ended here; so must the schedule.
            return Ok(None);
        };
        let Decision::Schedule { chosen, .. } = decision else {
            return Err(Failure::ReplayDivergence {
                step,
                detail: format!("expected a schedule decision, trace has {decision:?}"),
            });
        };
        let chosen = *chosen;
        // Ids are compared by value only: the monotonic allocation order is
        // identical across runs, while the generation tags the iteration.
        match enabled.iter().find(|op| op.machine.value == chosen.value) {
            Some(op) => Ok(Some(op.op)),
            None => Err(Failure::ReplayDivergence {
                step,
                detail: format!(
                    "recorded machine {}:{} is not enabled",
                    chosen.value, chosen.generation
                ),
            }),
        }
    }

    fn next_boolean(&mut self, _max: u32) -> Result<bool> {
        let step = self.step();
        match self.next_decision() {
            Some(Decision::Boolean { value, .. }) => Ok(*value),
            other => Err(Failure::ReplayDivergence {
                step,
                detail: format!("expected a boolean decision, trace has {other:?}"),
            }),
        }
    }

    fn next_integer(&mut self, _max: u32) -> Result<i32> {
        let step = self.step();
        match self.next_decision() {
            Some(Decision::Integer { value, .. }) => Ok(*value),
            other => Err(Failure::ReplayDivergence {
                step,
                detail: format!("expected an integer decision, trace has {other:?}"),
            }),
        }
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        if self.ran_once {
            return false;
        }
        self.ran_once = true;
        self.cursor = 0;
        true
    }
}
