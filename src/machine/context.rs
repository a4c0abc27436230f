//! The capability context handed to machine actions.
//!
//! Actions receive an [`ActionCx`] alongside `&mut self`. All effects flow
//! through it: transitions, raises, sends, machine creation, blocking
//! receive, assertions, and nondeterministic choices. There is no ambient
//! runtime access from inside an action.
//!
//! The context enforces the transition discipline: at most one of
//! goto/push/pop/raise per action, and none inside an on-exit handler.

use crate::error::{Failure, Result};
use crate::event::{Event, EventKind, EventOrigin, OperationGroupId, SendOptions};
use crate::machine::MachineLogic;
use crate::runtime::{MachineSpawn, RuntimeCore};
use crate::types::{MachineId, MachineKind, StateName};

/// Which handler slot is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActionPhase {
    /// An on-entry action.
    Entry,
    /// An on-exit action. Transition statements are forbidden here.
    Exit,
    /// A do-action or goto-transition action.
    Handler,
}

/// Whether the executing code belongs to a machine or a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CxRole {
    Machine,
    Monitor,
}

/// A transition recorded by an action, applied after the action returns.
#[derive(Debug)]
pub(crate) enum PendingTransition {
    Goto(StateName, Option<Event>),
    Push(StateName),
    Pop,
}

/// Capability context for one action invocation.
pub struct ActionCx<'a> {
    rt: &'a dyn RuntimeCore,
    id: &'a MachineId,
    state: StateName,
    role: CxRole,
    phase: ActionPhase,
    pub(crate) op_group: OperationGroupId,
    transitions: u32,
    pub(crate) pending: Option<PendingTransition>,
    pub(crate) raised: Option<Event>,
}

impl<'a> ActionCx<'a> {
    pub(crate) fn new(
        rt: &'a dyn RuntimeCore,
        id: &'a MachineId,
        state: StateName,
        role: CxRole,
        phase: ActionPhase,
        op_group: OperationGroupId,
    ) -> Self {
        Self {
            rt,
            id,
            state,
            role,
            phase,
            op_group,
            transitions: 0,
            pending: None,
            raised: None,
        }
    }

    /// The id of the machine this action runs in.
    #[must_use]
    pub fn self_id(&self) -> &MachineId {
        self.id
    }

    /// Name of the state whose action is running.
    #[must_use]
    pub const fn current_state(&self) -> StateName {
        self.state
    }

    /// The machine's current operation group.
    #[must_use]
    pub const fn operation_group_id(&self) -> OperationGroupId {
        self.op_group
    }

    // ── transition statements ───────────────────────────────────────────

    /// Records a transition to `target`, applied when the action returns.
    pub fn goto(&mut self, target: impl Into<StateName>) -> Result<()> {
        self.note_transition()?;
        self.pending = Some(PendingTransition::Goto(target.into(), None));
        Ok(())
    }

    /// Like [`ActionCx::goto`], carrying `event` into the target's on-entry.
    pub fn goto_with(&mut self, target: impl Into<StateName>, event: Event) -> Result<()> {
        self.note_transition()?;
        self.pending = Some(PendingTransition::Goto(target.into(), Some(event)));
        Ok(())
    }

    /// Records a push of `target` onto the state stack.
    pub fn push(&mut self, target: impl Into<StateName>) -> Result<()> {
        self.deny_monitor("push")?;
        self.note_transition()?;
        self.pending = Some(PendingTransition::Push(target.into()));
        Ok(())
    }

    /// Records a pop of the current state.
    pub fn pop(&mut self) -> Result<()> {
        self.deny_monitor("pop")?;
        self.note_transition()?;
        self.pending = Some(PendingTransition::Pop);
        Ok(())
    }

    /// Raises `event`: it is processed before the next inbox dequeue.
    pub fn raise(&mut self, mut event: Event) -> Result<()> {
        self.note_transition()?;
        if event.op_group.is_empty() {
            event.op_group = self.op_group;
        }
        self.raised = Some(event);
        Ok(())
    }

    /// Halts the machine by raising the halt event.
    pub fn halt(&mut self) -> Result<()> {
        self.raise(Event::new(EventKind::HALT))
    }

    // ── communication ───────────────────────────────────────────────────

    /// Sends `event` to `target` with default options.
    pub fn send(&mut self, target: &MachineId, event: Event) -> Result<()> {
        self.send_with(target, event, SendOptions::new())
    }

    /// Sends `event` to `target` with explicit options.
    ///
    /// Operation-group resolution: explicit option, else the sender's
    /// current group, else empty.
    pub fn send_with(
        &mut self,
        target: &MachineId,
        mut event: Event,
        options: SendOptions,
    ) -> Result<()> {
        self.deny_monitor("send")?;
        event.op_group = options
            .operation_group_id
            .unwrap_or(self.op_group);
        event.origin = Some(EventOrigin {
            sender: self.id.clone(),
            sender_state: self.state.as_str(),
        });
        self.rt.send_from(target, event, &options)
    }

    /// Blocks until an event of one of `kinds` is available, and returns it.
    ///
    /// The received event's operation group becomes the machine's current
    /// group, as with a dequeue.
    pub fn receive(&mut self, kinds: &[EventKind]) -> Result<Event> {
        self.deny_monitor("receive")?;
        if kinds.is_empty() {
            return Err(Failure::assertion("receive requires at least one event kind")
                .attributed_to(self.id));
        }
        let event = self.rt.receive_blocking(self.id, kinds)?;
        self.op_group = event.operation_group_id();
        Ok(event)
    }

    /// Creates a machine of type `N`, initialized from `Default`.
    ///
    /// Creation is asynchronous: the id returns immediately; the new
    /// machine enters its start state before observing any inbound event.
    pub fn create_machine<N: MachineLogic + Default>(
        &mut self,
        init: Option<Event>,
    ) -> Result<MachineId> {
        self.deny_monitor("create_machine")?;
        self.rt.spawn_machine(MachineSpawn::of::<N>(
            MachineKind::Regular,
            None,
            init,
            self.op_group,
        ))
    }

    /// Like [`ActionCx::create_machine`] with a friendly name.
    pub fn create_machine_named<N: MachineLogic + Default>(
        &mut self,
        friendly_name: &str,
        init: Option<Event>,
    ) -> Result<MachineId> {
        self.deny_monitor("create_machine")?;
        self.rt.spawn_machine(MachineSpawn::of::<N>(
            MachineKind::Regular,
            Some(friendly_name.to_owned()),
            init,
            self.op_group,
        ))
    }

    /// Steps the registered monitor of type `Mon` with `event`.
    pub fn invoke_monitor<Mon: MachineLogic>(&mut self, event: &Event) -> Result<()> {
        self.rt.invoke_monitor_by_name(Mon::NAME, event)
    }

    // ── checks and choices ──────────────────────────────────────────────

    /// Fails the execution if `condition` is false.
    pub fn assert(&mut self, condition: bool, message: &str) -> Result<()> {
        if condition {
            Ok(())
        } else {
            Err(Failure::assertion(message).attributed_to(self.id))
        }
    }

    /// Returns a controlled boolean choice: true with probability `1/max`.
    pub fn random_bool(&mut self, max: u32) -> Result<bool> {
        self.rt.next_boolean(max)
    }

    /// Returns a controlled integer choice in `[0, max)`.
    pub fn random_int(&mut self, max: u32) -> Result<i32> {
        self.rt.next_integer(max)
    }

    // ── internals ───────────────────────────────────────────────────────

    /// The backend behind this context (for in-crate helpers like timers).
    pub(crate) fn runtime(&self) -> &'a dyn RuntimeCore {
        self.rt
    }

    pub(crate) fn into_effect(self) -> ActionEffect {
        ActionEffect {
            pending: self.pending,
            raised: self.raised,
            op_group: self.op_group,
        }
    }

    fn note_transition(&mut self) -> Result<()> {
        if self.phase == ActionPhase::Exit {
            return Err(Failure::Transition {
                misuse: crate::error::TransitionMisuse::TransitionInsideOnExit,
                machine: self.id.clone(),
                state: self.state,
            });
        }
        self.transitions += 1;
        if self.transitions > 1 {
            return Err(Failure::Transition {
                misuse: crate::error::TransitionMisuse::TooManyTransitions,
                machine: self.id.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn deny_monitor(&self, operation: &str) -> Result<()> {
        if self.role == CxRole::Monitor {
            return Err(Failure::assertion(format!(
                "monitors cannot {operation}"
            ))
            .attributed_to(self.id));
        }
        Ok(())
    }
}

/// What an action left behind: at most one transition or raise, plus the
/// possibly-updated operation group.
pub(crate) struct ActionEffect {
    pub(crate) pending: Option<PendingTransition>,
    pub(crate) raised: Option<Event>,
    pub(crate) op_group: OperationGroupId,
}

impl ActionEffect {
    pub(crate) const fn is_empty(&self) -> bool {
        self.pending.is_none() && self.raised.is_none()
    }
}
