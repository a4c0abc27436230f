//! The controlled scheduler: one enabled operation at a time.
//!
//! Every externally visible step (create, send, dequeue/receive, stop,
//! nondeterministic choice) passes through this scheduler. It records the
//! decision in the schedule trace, consults the strategy for the next
//! operation, signals that operation's gate, and blocks the caller on its
//! own gate. The host may run many threads, but only the operation whose
//! gate was last signaled makes progress.
//!
//! The scheduler also owns iteration termination: step bounds, deadlock
//! detection (a deadlock with a hot monitor is a liveness bug), cycle-based
//! liveness detection over program-state fingerprints, and the cooperative
//! cancellation that unwinds every parked operation at iteration end.

use crate::error::{Failure, Result};
use crate::lab::fingerprint::{FingerprintBuilder, FingerprintCache};
use crate::lab::operation::{Gate, OpId, OpRecord, OpStatus, SchedulableOp, SchedulePointKind};
use crate::lab::strategy::SchedulingStrategy;
use crate::lab::trace::{Decision, ScheduleTrace};
use crate::tracing_compat::{debug, trace};
use crate::types::{CompactMachineId, StateName};
use crate::util::det_hash::det_hash;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// How an iteration ended.
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    /// No operation was enabled; the schedule completed normally.
    Completed {
        /// Steps executed.
        steps: u64,
    },
    /// The per-iteration step bound was hit. Not a bug.
    MaxStepsReached {
        /// Steps executed.
        steps: u64,
    },
    /// A bug surfaced.
    BugFound {
        /// The failure.
        failure: Failure,
        /// Step at which it surfaced.
        step: u64,
    },
}

impl IterationOutcome {
    /// The bug, if this outcome carries one.
    #[must_use]
    pub fn bug(&self) -> Option<&Failure> {
        match self {
            Self::BugFound { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// The scheduler's read-only view of program state, provided by the
/// controlled runtime (machine map and monitor registry).
pub(crate) trait ProgramStateView: Send + Sync {
    /// Deterministic hash over all live machines' cached state plus all
    /// monitors' cached state.
    fn state_component_hash(&self) -> u64;

    /// Monitors currently hot: `(type, state, hot_since_step)`.
    fn hot_monitors(&self) -> Vec<(&'static str, StateName, u64)>;
}

/// Scheduler configuration derived from the test configuration.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) max_steps: u64,
    pub(crate) liveness_checking: bool,
    pub(crate) cycle_detection: bool,
    pub(crate) cache_program_state: bool,
    pub(crate) seed: u64,
    pub(crate) strategy_name: &'static str,
    pub(crate) fingerprint_history: usize,
}

struct SchedState {
    ops: BTreeMap<OpId, OpRecord>,
    current: Option<OpId>,
    next_op_id: u64,
    steps: u64,
    trace: ScheduleTrace,
    outcome: Option<IterationOutcome>,
    fingerprints: FingerprintCache,
}

/// The controlled scheduler for one iteration.
pub(crate) struct ControlledScheduler {
    state: Mutex<SchedState>,
    done: Condvar,
    strategy: Arc<Mutex<Box<dyn SchedulingStrategy>>>,
    view: Mutex<Option<Weak<dyn ProgramStateView>>>,
    canceled: AtomicBool,
    config: SchedulerConfig,
}

enum AfterChoice {
    /// The caller was chosen again; keep running.
    Continue,
    /// Another operation was signaled; wait on this gate.
    Park(Arc<Gate>),
    /// The iteration is over.
    Canceled,
}

impl ControlledScheduler {
    pub(crate) fn new(
        config: SchedulerConfig,
        strategy: Arc<Mutex<Box<dyn SchedulingStrategy>>>,
    ) -> Self {
        let trace = ScheduleTrace::new(config.seed, config.strategy_name);
        Self {
            state: Mutex::new(SchedState {
                ops: BTreeMap::new(),
                current: None,
                next_op_id: 0,
                steps: 0,
                trace,
                outcome: None,
                fingerprints: FingerprintCache::new(config.fingerprint_history),
            }),
            done: Condvar::new(),
            strategy,
            view: Mutex::new(None),
            canceled: AtomicBool::new(false),
            config,
        }
    }

    /// Installs the program-state view once the runtime exists.
    pub(crate) fn set_view(&self, view: Weak<dyn ProgramStateView>) {
        *self.view.lock() = Some(view);
    }

    /// Registers a new operation, initially enabled.
    pub(crate) fn register_op(&self, machine: CompactMachineId) -> (OpId, Arc<Gate>) {
        let mut state = self.state.lock();
        let id = OpId(state.next_op_id);
        state.next_op_id += 1;
        let gate = Arc::new(Gate::new());
        state.ops.insert(
            id,
            OpRecord {
                id,
                machine,
                gate: gate.clone(),
                status: OpStatus::Enabled,
            },
        );
        if state.outcome.is_some() {
            // The iteration already ended; let the new operation's thread
            // observe cancellation instead of parking forever.
            gate.signal();
        }
        trace!(op = %id, machine = machine.value, "operation registered");
        (id, gate)
    }

    /// Marks the harness operation as the initially running one.
    pub(crate) fn start_with(&self, op: OpId) {
        self.state.lock().current = Some(op);
    }

    /// A scheduling point: the caller yields and the strategy picks who
    /// runs next (possibly the caller again).
    pub(crate) fn schedule(&self, caller: OpId, point: SchedulePointKind) -> Result<()> {
        self.transition(caller, point, None)
    }

    /// The caller's inbox has nothing deliverable; it parks until a sender
    /// re-enables it and the strategy picks it.
    pub(crate) fn yield_idle(&self, caller: OpId) -> Result<()> {
        self.transition(caller, SchedulePointKind::Receive, Some(OpStatus::Idle))
    }

    /// The caller is blocked in `receive`; it parks until a matching
    /// enqueue re-enables it and the strategy picks it.
    pub(crate) fn block_receive(&self, caller: OpId) -> Result<()> {
        self.transition(
            caller,
            SchedulePointKind::Receive,
            Some(OpStatus::WaitingReceive),
        )
    }

    /// The caller's operation is done (machine halted or harness
    /// returned). Dispatches the next operation without parking.
    pub(crate) fn complete(&self, caller: OpId) {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return;
        }
        if let Some(record) = state.ops.get_mut(&caller) {
            record.status = OpStatus::Completed;
        }
        debug!(op = %caller, "operation completed");
        // Dispatch whoever is next; the caller's thread exits.
        let _ = self.choose_next(&mut state, caller, SchedulePointKind::Stop);
    }

    /// Re-enables a parked operation after a matching enqueue.
    pub(crate) fn enable(&self, op: OpId) {
        let mut state = self.state.lock();
        if let Some(record) = state.ops.get_mut(&op) {
            if record.status != OpStatus::Completed {
                record.status = OpStatus::Enabled;
            }
        }
    }

    /// Resolves a nondeterministic boolean through the strategy, recording
    /// the decision.
    pub(crate) fn choice_boolean(&self, max: u32) -> Result<bool> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(Failure::Canceled);
        }
        let mut state = self.state.lock();
        let value = match self.strategy.lock().next_boolean(max) {
            Ok(value) => value,
            Err(failure) => {
                let step = state.steps;
                self.finish(
                    &mut state,
                    Some(IterationOutcome::BugFound {
                        failure: failure.clone(),
                        step,
                    }),
                );
                return Err(failure);
            }
        };
        let step = state.steps;
        state.trace.push(Decision::Boolean { value, step });
        Ok(value)
    }

    /// Resolves a nondeterministic integer through the strategy, recording
    /// the decision.
    pub(crate) fn choice_integer(&self, max: u32) -> Result<i32> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(Failure::Canceled);
        }
        let mut state = self.state.lock();
        let value = match self.strategy.lock().next_integer(max) {
            Ok(value) => value,
            Err(failure) => {
                let step = state.steps;
                self.finish(
                    &mut state,
                    Some(IterationOutcome::BugFound { failure: failure.clone(), step }),
                );
                return Err(failure);
            }
        };
        let step = state.steps;
        state.trace.push(Decision::Integer { value, step });
        Ok(value)
    }

    /// Reports a bug found outside the scheduler (an action failure).
    pub(crate) fn report_bug(&self, failure: Failure) {
        if failure.is_canceled() {
            return;
        }
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return;
        }
        let step = state.steps;
        self.finish(
            &mut state,
            Some(IterationOutcome::BugFound { failure, step }),
        );
    }

    /// Blocks until the iteration ends and returns its outcome.
    pub(crate) fn await_completion(&self) -> IterationOutcome {
        let mut state = self.state.lock();
        while state.outcome.is_none() {
            self.done.wait(&mut state);
        }
        state.outcome.clone().expect("outcome set")
    }

    /// Current step count.
    pub(crate) fn steps(&self) -> u64 {
        self.state.lock().steps
    }

    /// Snapshot of the recorded trace.
    pub(crate) fn trace_snapshot(&self) -> ScheduleTrace {
        self.state.lock().trace.clone()
    }

    /// True once the iteration has been canceled.
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    // ── internals ───────────────────────────────────────────────────────

    fn transition(
        &self,
        caller: OpId,
        point: SchedulePointKind,
        park_as: Option<OpStatus>,
    ) -> Result<()> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(Failure::Canceled);
        }
        let after = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                AfterChoice::Canceled
            } else {
                state.steps += 1;
                if state.steps > self.config.max_steps {
                    let steps = state.steps;
                    self.finish(&mut state, Some(IterationOutcome::MaxStepsReached { steps }));
                    AfterChoice::Canceled
                } else {
                    if let Some(status) = park_as {
                        if let Some(record) = state.ops.get_mut(&caller) {
                            record.status = status;
                        }
                    }
                    self.observe_fingerprint(&mut state);
                    if state.outcome.is_some() {
                        AfterChoice::Canceled
                    } else {
                        self.choose_next(&mut state, caller, point)
                    }
                }
            }
        };
        match after {
            AfterChoice::Continue => Ok(()),
            AfterChoice::Park(gate) => {
                gate.wait();
                if self.canceled.load(Ordering::Acquire) {
                    Err(Failure::Canceled)
                } else {
                    Ok(())
                }
            }
            AfterChoice::Canceled => Err(Failure::Canceled),
        }
    }

    /// Picks and dispatches the next operation. Must run under the state
    /// lock; returns what the caller should do.
    fn choose_next(
        &self,
        state: &mut SchedState,
        caller: OpId,
        point: SchedulePointKind,
    ) -> AfterChoice {
        let enabled: Vec<SchedulableOp> = state
            .ops
            .values()
            .filter(|record| record.status.is_enabled())
            .map(|record| SchedulableOp {
                op: record.id,
                machine: record.machine,
            })
            .collect();

        if enabled.is_empty() {
            return self.finish_empty_enabled(state);
        }

        let chosen = {
            let mut strategy = self.strategy.lock();
            match strategy.next_operation(&enabled, state.current) {
                Ok(Some(op)) => op,
                Ok(None) => {
                    let steps = state.steps;
                    self.finish(state, Some(IterationOutcome::Completed { steps }));
                    return AfterChoice::Canceled;
                }
                Err(failure) => {
                    let step = state.steps;
                    self.finish(
                        state,
                        Some(IterationOutcome::BugFound { failure, step }),
                    );
                    return AfterChoice::Canceled;
                }
            }
        };

        let machine = state.ops[&chosen].machine;
        let step = state.steps;
        state.trace.push(Decision::Schedule {
            point,
            chosen: machine,
            step,
        });
        state.current = Some(chosen);
        trace!(op = %chosen, machine = machine.value, ?point, step, "scheduled");

        if chosen == caller {
            AfterChoice::Continue
        } else {
            let gate = state.ops[&chosen].gate.clone();
            gate.signal();
            let own_gate = state.ops[&caller].gate.clone();
            AfterChoice::Park(own_gate)
        }
    }

    /// No operation is enabled: a deadlock with a hot monitor is a
    /// liveness bug, otherwise the schedule completed normally.
    fn finish_empty_enabled(&self, state: &mut SchedState) -> AfterChoice {
        let steps = state.steps;
        let outcome = if self.config.liveness_checking {
            self.hot_monitor().map(|(monitor, hot_state)| {
                IterationOutcome::BugFound {
                    failure: Failure::Liveness {
                        monitor,
                        state: hot_state,
                    },
                    step: steps,
                }
            })
        } else {
            None
        };
        self.finish(
            state,
            Some(outcome.unwrap_or(IterationOutcome::Completed { steps })),
        );
        AfterChoice::Canceled
    }

    fn hot_monitor(&self) -> Option<(&'static str, StateName)> {
        let view = self.view.lock().as_ref()?.upgrade()?;
        view.hot_monitors()
            .first()
            .map(|(monitor, state, _)| (*monitor, *state))
    }

    /// Fingerprints the program state and, with cycle detection on,
    /// reports a liveness bug when a cycle leaves a monitor hot.
    fn observe_fingerprint(&self, state: &mut SchedState) {
        if !self.config.cycle_detection && !self.config.cache_program_state {
            return;
        }
        let Some(view) = self.view.lock().as_ref().and_then(Weak::upgrade) else {
            return;
        };

        let mut builder = FingerprintBuilder::new();
        builder.hasher().write_u64(view.state_component_hash());
        for record in state.ops.values() {
            if record.status != OpStatus::Completed {
                builder.add_machine(record.machine.value, 0, status_tag(record.status));
            }
        }
        let fingerprint = builder.finish();

        let enabled: Vec<u64> = state
            .ops
            .values()
            .filter(|record| record.status.is_enabled())
            .map(|record| record.machine.value)
            .collect();
        let enabled_hash = det_hash(&enabled);

        let steps = state.steps;
        let Some(hit) = state.fingerprints.observe(fingerprint, enabled_hash, steps) else {
            return;
        };
        if !self.config.cycle_detection {
            return;
        }
        // A revisited state with a monitor hot since before the first
        // visit: the obligation survived a full cycle.
        let Some(view) = self.view.lock().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if let Some((monitor, hot_state, _)) = view
            .hot_monitors()
            .into_iter()
            .find(|(_, _, since)| *since <= hit.first_seen_step)
        {
            debug!(monitor, first_seen = hit.first_seen_step, revisit = hit.revisit_step, "hot cycle detected");
            self.finish(
                state,
                Some(IterationOutcome::BugFound {
                    failure: Failure::Liveness {
                        monitor,
                        state: hot_state,
                    },
                    step: steps,
                }),
            );
        }
    }

    /// Ends the iteration: stores the outcome, cancels every operation,
    /// and wakes everything.
    fn finish(&self, state: &mut SchedState, outcome: Option<IterationOutcome>) {
        if state.outcome.is_some() {
            return;
        }
        let Some(outcome) = outcome else { return };
        debug!(?outcome, "iteration finished");
        state.outcome = Some(outcome);
        self.canceled.store(true, Ordering::Release);
        for record in state.ops.values() {
            record.gate.signal();
        }
        self.done.notify_all();
    }
}

fn status_tag(status: OpStatus) -> u8 {
    match status {
        OpStatus::Enabled => 0,
        OpStatus::Idle => 1,
        OpStatus::WaitingReceive => 2,
        OpStatus::Completed => 3,
    }
}

impl std::fmt::Debug for ControlledScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ControlledScheduler")
            .field("ops", &state.ops.len())
            .field("steps", &state.steps)
            .field("outcome", &state.outcome)
            .finish()
    }
}
