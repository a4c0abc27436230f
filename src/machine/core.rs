//! Machine core: state stack, handler dispatch, transition application.
//!
//! One [`MachineCore`] exists per live machine. It owns the user's logic
//! struct, the state stack, and the current operation group, and it executes
//! the handler run loop semantics:
//!
//! - dequeued (or raised) events dispatch against the top state;
//! - a state with no binding unwinds the stack (running exits) until a
//!   handling state is found, failing with an unhandled-event bug at the
//!   bottom (the halt event halts gracefully instead);
//! - transitions recorded by actions are applied after the action returns;
//! - a raised event preempts the next inbox dequeue.
//!
//! The runtime talks to cores through the object-safe [`DynMachine`] trait
//! so machines of different types share one map.

use crate::error::{Failure, Result, TransitionMisuse};
use crate::event::{Event, EventKind, OperationGroupId};
use crate::machine::context::{ActionCx, ActionEffect, ActionPhase, CxRole, PendingTransition};
use crate::machine::decl::{Action, Binding, MachineDecl};
use crate::machine::inbox::DequeueFilter;
use crate::machine::{MachineLogic, Temperature};
use crate::runtime::RuntimeCore;
use crate::tracing_compat::{debug, trace};
use crate::types::{MachineId, StateName};
use crate::util::det_hash::DetHasher;
use smallvec::SmallVec;
use std::hash::Hasher;
use std::sync::Arc;

/// Outcome of one handler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// The machine is still live.
    Continue,
    /// The machine halted during this step.
    Halted,
}

/// Object-safe view of a machine core.
pub(crate) trait DynMachine: Send {
    /// Machine type name.
    fn type_name(&self) -> &'static str;

    /// The machine's id.
    fn id(&self) -> &MachineId;

    /// Pushes the start state and runs its on-entry with the init event.
    fn enter_start(&mut self, rt: &dyn RuntimeCore, init: Option<&Event>) -> Result<StepOutcome>;

    /// Dispatches one event (dequeued, synthesized, or init-raised).
    fn handle_event(&mut self, rt: &dyn RuntimeCore, event: Event) -> Result<StepOutcome>;

    /// Snapshot of the top state's event filtering, for the inbox.
    fn dequeue_filter(&self) -> DequeueFilter;

    /// True once the machine halted.
    fn is_halted(&self) -> bool;

    /// Name of the current (top) state.
    fn current_state(&self) -> StateName;

    /// Temperature of the current state (monitors).
    fn temperature(&self) -> Temperature;

    /// Deterministic hash of the state stack.
    fn state_hash(&self) -> u64;

    /// The machine's current operation group.
    fn operation_group(&self) -> OperationGroupId;
}

/// The typed core behind [`DynMachine`].
pub(crate) struct MachineCore<M: MachineLogic> {
    id: MachineId,
    decl: Arc<MachineDecl<M>>,
    logic: M,
    stack: SmallVec<[StateName; 4]>,
    role: CxRole,
    op_group: OperationGroupId,
    halted: bool,
    state_hash: u64,
}

impl<M: MachineLogic> MachineCore<M> {
    pub(crate) fn new(id: MachineId, decl: Arc<MachineDecl<M>>, logic: M) -> Self {
        let mut core = Self {
            id,
            decl,
            logic,
            stack: SmallVec::new(),
            role: CxRole::Machine,
            op_group: OperationGroupId::EMPTY,
            halted: false,
            state_hash: 0,
        };
        core.update_state_hash();
        core
    }

    pub(crate) fn new_monitor(id: MachineId, decl: Arc<MachineDecl<M>>, logic: M) -> Self {
        let mut core = Self::new(id, decl, logic);
        core.role = CxRole::Monitor;
        core
    }

    fn top(&self) -> StateName {
        *self.stack.last().expect("live machine has a non-empty stack")
    }

    fn descriptor(&self, state: StateName) -> &crate::machine::decl::StateDescriptor<M> {
        self.decl
            .state(state)
            .expect("stack only holds declared states")
    }

    fn update_state_hash(&mut self) {
        let mut hasher = DetHasher::default();
        hasher.write(self.decl.type_name().as_bytes());
        for state in &self.stack {
            hasher.write(state.as_str().as_bytes());
            hasher.write_u8(b'/');
        }
        hasher.write_u8(u8::from(self.halted));
        self.state_hash = hasher.finish();
    }

    /// Runs one action and returns what it left behind.
    fn run_action(
        &mut self,
        rt: &dyn RuntimeCore,
        action: &Action<M>,
        event: &Event,
        phase: ActionPhase,
    ) -> Result<ActionEffect> {
        let mut cx = ActionCx::new(rt, &self.id, self.top(), self.role, phase, self.op_group);
        action(&mut self.logic, &mut cx, event)?;
        let effect = cx.into_effect();
        self.op_group = effect.op_group;
        Ok(effect)
    }

    /// Runs the exit action of the top state, if any. Transitions are
    /// rejected by the context; raises too (a raise is a transition
    /// statement).
    fn run_exit(&mut self, rt: &dyn RuntimeCore, event: &Event) -> Result<()> {
        let exit = self.descriptor(self.top()).exit.clone();
        if let Some(action) = exit {
            let effect = self.run_action(rt, &action, event, ActionPhase::Exit)?;
            debug_assert!(effect.is_empty(), "exit context rejects transitions");
        }
        Ok(())
    }

    /// Enters `state`: push, record coverage, run on-entry, apply whatever
    /// the entry action decided. Returns a raised event, if any.
    fn enter_state(
        &mut self,
        rt: &dyn RuntimeCore,
        state: StateName,
        event: &Event,
    ) -> Result<EntryResult> {
        self.stack.push(state);
        self.update_state_hash();
        rt.record_state_visit(self.decl.type_name(), state);
        trace!(machine = %self.id, state = %state, "enter state");

        let entry = self.descriptor(state).entry.clone();
        if let Some(action) = entry {
            let effect = self.run_action(rt, &action, event, ActionPhase::Entry)?;
            if let Some(pending) = effect.pending {
                return self.apply_pending(rt, pending, event);
            }
            if let Some(raised) = effect.raised {
                return Ok(EntryResult::Raised(raised));
            }
        }
        Ok(EntryResult::Settled)
    }

    /// Applies a pending transition recorded by an action.
    fn apply_pending(
        &mut self,
        rt: &dyn RuntimeCore,
        pending: PendingTransition,
        event: &Event,
    ) -> Result<EntryResult> {
        match pending {
            PendingTransition::Goto(target, carrier) => {
                let carrier = carrier.unwrap_or_else(|| event.clone());
                self.goto_state(rt, target, &carrier)
            }
            PendingTransition::Push(target) => self.enter_state(rt, target, event),
            PendingTransition::Pop => {
                self.pop_state(rt, event)?;
                Ok(EntryResult::Settled)
            }
        }
    }

    /// Goto: exit the top state, replace it, enter the target.
    fn goto_state(
        &mut self,
        rt: &dyn RuntimeCore,
        target: StateName,
        carrier: &Event,
    ) -> Result<EntryResult> {
        let from = self.top();
        self.run_exit(rt, carrier)?;
        self.stack.pop();
        rt.record_transition(self.decl.type_name(), from, carrier.kind(), target);
        self.enter_state(rt, target, carrier)
    }

    /// Pop: exit and remove the top state. The re-exposed state's entry
    /// does not run again.
    fn pop_state(&mut self, rt: &dyn RuntimeCore, event: &Event) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Failure::Transition {
                misuse: TransitionMisuse::PopFromEmptyStack,
                machine: self.id.clone(),
                state: self.top(),
            });
        }
        self.run_exit(rt, event)?;
        let from = self.stack.pop().expect("checked above");
        self.update_state_hash();
        rt.record_transition(self.decl.type_name(), from, event.kind(), self.top());
        Ok(())
    }

    /// Halts the machine. Exit handlers do not run on halt.
    fn halt(&mut self) {
        debug!(machine = %self.id, "machine halted");
        self.halted = true;
        self.update_state_hash();
    }

    /// Finds the binding for `kind`, unwinding the stack if the top state
    /// has none. Returns `None` when the machine halted gracefully on an
    /// unhandled halt event.
    fn resolve_binding(
        &mut self,
        rt: &dyn RuntimeCore,
        event: &Event,
    ) -> Result<Option<Binding<M>>> {
        loop {
            let top = self.top();
            if let Some(binding) = self.descriptor(top).bindings.get(&event.kind()) {
                return Ok(Some(binding.clone()));
            }
            if self.stack.len() == 1 {
                if event.kind() == EventKind::HALT {
                    self.halt();
                    return Ok(None);
                }
                return Err(Failure::UnhandledEvent {
                    machine: self.id.clone(),
                    kind: event.kind(),
                    state: top,
                });
            }
            // Unwind one frame and retry against the state below.
            self.run_exit(rt, event)?;
            self.stack.pop();
            self.update_state_hash();
            trace!(machine = %self.id, popped = %top, "unwound unhandled frame");
        }
    }
}

/// What running an entry (or a chain of transitions) produced.
enum EntryResult {
    /// No further work.
    Settled,
    /// An event was raised; it preempts the next dequeue.
    Raised(Event),
}

impl<M: MachineLogic> DynMachine for MachineCore<M> {
    fn type_name(&self) -> &'static str {
        self.decl.type_name()
    }

    fn id(&self) -> &MachineId {
        &self.id
    }

    fn enter_start(&mut self, rt: &dyn RuntimeCore, init: Option<&Event>) -> Result<StepOutcome> {
        debug_assert!(self.stack.is_empty(), "enter_start runs once");
        let carrier = init.cloned().unwrap_or_else(|| Event::new(EventKind::DEFAULT));
        self.op_group = carrier.operation_group_id();
        let start = self.decl.start_state();
        match self.enter_state(rt, start, &carrier)? {
            EntryResult::Settled => Ok(StepOutcome::Continue),
            EntryResult::Raised(raised) => self.handle_event(rt, raised),
        }
    }

    fn handle_event(&mut self, rt: &dyn RuntimeCore, event: Event) -> Result<StepOutcome> {
        if self.halted {
            return Ok(StepOutcome::Halted);
        }
        // The dequeued event's group becomes the machine's current group.
        self.op_group = event.operation_group_id();

        let mut event = event;
        loop {
            let Some(binding) = self.resolve_binding(rt, &event)? else {
                return Ok(StepOutcome::Halted);
            };

            let entry_result = match binding {
                Binding::Do(action) => {
                    let effect = self.run_action(rt, &action, &event, ActionPhase::Handler)?;
                    if let Some(pending) = effect.pending {
                        self.apply_pending(rt, pending, &event)?
                    } else if let Some(raised) = effect.raised {
                        EntryResult::Raised(raised)
                    } else {
                        EntryResult::Settled
                    }
                }
                Binding::Goto(target, action) => {
                    if let Some(action) = action {
                        let effect =
                            self.run_action(rt, &action, &event, ActionPhase::Handler)?;
                        if effect.pending.is_some() || effect.raised.is_some() {
                            return Err(Failure::Transition {
                                misuse: TransitionMisuse::TooManyTransitions,
                                machine: self.id.clone(),
                                state: self.top(),
                            });
                        }
                    }
                    self.goto_state(rt, target, &event)?
                }
                Binding::Push(target) => self.enter_state(rt, target, &event)?,
                Binding::Pop => {
                    self.pop_state(rt, &event)?;
                    EntryResult::Settled
                }
            };

            match entry_result {
                EntryResult::Settled => return Ok(StepOutcome::Continue),
                EntryResult::Raised(raised) => {
                    if raised.kind() == EventKind::HALT
                        && !self.descriptor(self.top()).handles(EventKind::HALT)
                    {
                        self.halt();
                        return Ok(StepOutcome::Halted);
                    }
                    event = raised;
                }
            }
        }
    }

    fn dequeue_filter(&self) -> DequeueFilter {
        let Some(top) = self.stack.last() else {
            // Not yet started; everything is deliverable once it is.
            return DequeueFilter::default();
        };
        let descriptor = self.descriptor(*top);
        DequeueFilter {
            deferred: descriptor.deferred.clone(),
            ignored: descriptor.ignored.clone(),
            has_default: self
                .stack
                .iter()
                .any(|state| self.descriptor(*state).handles(EventKind::DEFAULT)),
        }
    }

    fn is_halted(&self) -> bool {
        self.halted
    }

    fn current_state(&self) -> StateName {
        self.top()
    }

    fn temperature(&self) -> Temperature {
        self.descriptor(self.top()).temperature()
    }

    fn state_hash(&self) -> u64 {
        self.state_hash
    }

    fn operation_group(&self) -> OperationGroupId {
        self.op_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::decl::DeclBuilder;
    use crate::runtime::testing::NullCore;

    const TICK: EventKind = EventKind::new("Tick");
    const NEXT: EventKind = EventKind::new("Next");
    const BACK: EventKind = EventKind::new("Back");

    #[derive(Default)]
    struct Walker {
        entries: Vec<&'static str>,
        exits: Vec<&'static str>,
        ticks: u32,
    }

    impl MachineLogic for Walker {
        const NAME: &'static str = "Walker";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("A")
                .start()
                .on_entry(|m, _cx, _ev| {
                    m.entries.push("A");
                    Ok(())
                })
                .on_exit(|m, _cx, _ev| {
                    m.exits.push("A");
                    Ok(())
                })
                .on(TICK, |m, _cx, _ev| {
                    m.ticks += 1;
                    Ok(())
                })
                .on_goto(NEXT, "B")
                .on_push(BACK, "B");
            decl.state("B")
                .on_entry(|m, _cx, _ev| {
                    m.entries.push("B");
                    Ok(())
                })
                .on(TICK, |m, cx, _ev| {
                    m.ticks += 1;
                    cx.pop()
                });
        }
    }

    fn walker_core() -> MachineCore<Walker> {
        let decl = Arc::new(MachineDecl::<Walker>::build().unwrap());
        MachineCore::new(
            MachineId::new_for_test(1, Walker::NAME),
            decl,
            Walker::default(),
        )
    }

    #[test]
    fn start_runs_entry_of_start_state() {
        let rt = NullCore::default();
        let mut core = walker_core();
        let outcome = core.enter_start(&rt, None).unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        assert_eq!(core.current_state(), StateName::new("A"));
        assert_eq!(core.logic.entries, vec!["A"]);
    }

    #[test]
    fn goto_runs_exit_then_entry() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();
        core.handle_event(&rt, Event::new(NEXT)).unwrap();
        assert_eq!(core.current_state(), StateName::new("B"));
        assert_eq!(core.logic.exits, vec!["A"]);
        assert_eq!(core.logic.entries, vec!["A", "B"]);
    }

    #[test]
    fn push_skips_exit_and_pop_returns() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();

        core.handle_event(&rt, Event::new(BACK)).unwrap();
        assert_eq!(core.current_state(), StateName::new("B"));
        assert!(core.logic.exits.is_empty(), "push runs no exit");

        // B's tick handler pops back to A; A's entry does not rerun.
        core.handle_event(&rt, Event::new(TICK)).unwrap();
        assert_eq!(core.current_state(), StateName::new("A"));
        assert_eq!(core.logic.entries, vec!["A", "B"]);
    }

    #[test]
    fn state_hash_tracks_stack() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();
        let in_a = core.state_hash();
        core.handle_event(&rt, Event::new(NEXT)).unwrap();
        assert_ne!(core.state_hash(), in_a);
    }

    #[test]
    fn unhandled_event_is_a_bug() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();
        let err = core
            .handle_event(&rt, Event::new(EventKind::new("Mystery")))
            .unwrap_err();
        assert!(matches!(err, Failure::UnhandledEvent { .. }));
    }

    #[test]
    fn unhandled_halt_event_halts_gracefully() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();
        let outcome = core.handle_event(&rt, Event::new(EventKind::HALT)).unwrap();
        assert_eq!(outcome, StepOutcome::Halted);
        assert!(core.is_halted());
    }

    #[test]
    fn op_group_is_inherited_from_event() {
        let rt = NullCore::default();
        let mut core = walker_core();
        core.enter_start(&rt, None).unwrap();

        let mut ev = Event::new(TICK);
        ev.op_group = OperationGroupId::from_raw(9);
        core.handle_event(&rt, ev).unwrap();
        assert_eq!(core.operation_group(), OperationGroupId::from_raw(9));
    }

    #[derive(Default)]
    struct Misbehaved;

    impl MachineLogic for Misbehaved {
        const NAME: &'static str = "Misbehaved";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("S")
                .start()
                .on(TICK, |_m, cx, _ev| {
                    cx.goto("T")?;
                    cx.raise(Event::new(NEXT))
                })
                .on(NEXT, |_m, cx, _ev| cx.pop())
                .on_exit(|_m, cx, _ev| cx.goto("T"));
            decl.state("T");
        }
    }

    #[test]
    fn two_transition_statements_are_rejected() {
        let decl = Arc::new(MachineDecl::<Misbehaved>::build().unwrap());
        let rt = NullCore::default();
        let mut core = MachineCore::new(
            MachineId::new_for_test(2, Misbehaved::NAME),
            decl,
            Misbehaved,
        );
        core.enter_start(&rt, None).unwrap();
        let err = core.handle_event(&rt, Event::new(TICK)).unwrap_err();
        assert!(matches!(
            err,
            Failure::Transition {
                misuse: TransitionMisuse::TooManyTransitions,
                ..
            }
        ));
    }

    #[test]
    fn pop_from_start_state_is_rejected() {
        let decl = Arc::new(MachineDecl::<Misbehaved>::build().unwrap());
        let rt = NullCore::default();
        let mut core = MachineCore::new(
            MachineId::new_for_test(3, Misbehaved::NAME),
            decl,
            Misbehaved,
        );
        core.enter_start(&rt, None).unwrap();
        let err = core.handle_event(&rt, Event::new(NEXT)).unwrap_err();
        assert!(matches!(
            err,
            Failure::Transition {
                misuse: TransitionMisuse::PopFromEmptyStack,
                ..
            }
        ));
    }
}
