//! Failure taxonomy.
//!
//! Every way an execution can go wrong is a [`Failure`] kind. Action
//! exceptions never cross machine boundaries as events; they propagate
//! through the handler-run wrapper to the runtime, which routes them to the
//! bug-report pipeline (controlled backend) or the failure callback
//! (production backend). [`Failure::Canceled`] is the one non-bug: it is the
//! cooperative termination signal of a controlled schedule and must be
//! propagated, never reported.

use crate::event::EventKind;
use crate::types::{MachineId, StateName};
use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Failure>;

/// Which transition rule a machine action broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMisuse {
    /// More than one of goto/push/pop/raise in a single action.
    TooManyTransitions,
    /// A transition statement inside an on-exit handler.
    TransitionInsideOnExit,
    /// A pop that would empty the state stack.
    PopFromEmptyStack,
}

impl std::fmt::Display for TransitionMisuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyTransitions => f.write_str("multiple transition statements in one action"),
            Self::TransitionInsideOnExit => f.write_str("transition statement inside on-exit"),
            Self::PopFromEmptyStack => f.write_str("pop would empty the state stack"),
        }
    }
}

/// An execution failure.
#[derive(Debug, Clone, Error)]
pub enum Failure {
    /// User assertion or internal invariant violation.
    #[error("assertion failed: {message}{}", fmt_machine(.machine))]
    Assertion {
        /// The failing assertion text.
        message: String,
        /// The machine responsible, when known.
        machine: Option<MachineId>,
        /// Schedule step at which the failure surfaced, when known.
        step: Option<u64>,
    },

    /// A machine action broke the transition discipline.
    #[error("{machine} in state {state}: {misuse}")]
    Transition {
        /// Which rule was broken.
        misuse: TransitionMisuse,
        /// The offending machine.
        machine: MachineId,
        /// The state whose action broke the rule.
        state: StateName,
    },

    /// Binding an id that is already bound, or reusing one whose machine
    /// has halted.
    #[error("machine id {id} is already bound")]
    DuplicateMachineId {
        /// The id in question.
        id: MachineId,
    },

    /// Binding an id created for one machine type to another type.
    #[error("id {id} was created for type {expected}, cannot bind type {actual}")]
    TypeMismatch {
        /// The id in question.
        id: MachineId,
        /// The type the id was created for.
        expected: &'static str,
        /// The type a caller tried to bind.
        actual: &'static str,
    },

    /// A machine exhausted its state stack without a handler for a dequeued
    /// event that was neither ignored nor deferred.
    #[error("{machine} has no handler for event '{kind}' (dequeued in state {state})")]
    UnhandledEvent {
        /// The machine that dequeued the event.
        machine: MachineId,
        /// The unhandled event kind.
        kind: EventKind,
        /// The state the machine was in at dequeue.
        state: StateName,
    },

    /// A machine halted (or was sent to after halting) with a must-handle
    /// event left undelivered.
    #[error("{machine} dropped must-handle event '{kind}'")]
    MustHandle {
        /// The machine that owed the handling.
        machine: MachineId,
        /// The dropped event kind.
        kind: EventKind,
    },

    /// A hot monitor state persisted across a detected cycle, or the
    /// program deadlocked while a monitor was hot.
    #[error("liveness violation: monitor {monitor} stayed hot in state {state}")]
    Liveness {
        /// The hot monitor's type name.
        monitor: &'static str,
        /// The hot state.
        state: StateName,
    },

    /// Replay observed a decision that diverges from the recorded trace;
    /// the test harness is nondeterministic.
    #[error("schedule replay diverged at step {step}: {detail}")]
    ReplayDivergence {
        /// Step index of the divergence.
        step: u64,
        /// What differed.
        detail: String,
    },

    /// Cooperative termination of a controlled schedule. Never a bug.
    #[error("execution canceled")]
    Canceled,
}

impl Failure {
    /// Creates an assertion failure with no attribution.
    #[must_use]
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion {
            message: message.into(),
            machine: None,
            step: None,
        }
    }

    /// Attributes the failure to a machine, where the variant carries one.
    #[must_use]
    pub fn attributed_to(mut self, mid: &MachineId) -> Self {
        if let Self::Assertion { machine, .. } = &mut self {
            if machine.is_none() {
                *machine = Some(mid.clone());
            }
        }
        self
    }

    /// Stamps the schedule step offset, where the variant carries one.
    #[must_use]
    pub fn at_step(mut self, at: u64) -> Self {
        if let Self::Assertion { step, .. } = &mut self {
            if step.is_none() {
                *step = Some(at);
            }
        }
        self
    }

    /// Returns true for the cooperative cancellation signal.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns true for failures that should be reported as bugs.
    #[must_use]
    pub const fn is_bug(&self) -> bool {
        !self.is_canceled()
    }
}

fn fmt_machine(machine: &Option<MachineId>) -> String {
    machine
        .as_ref()
        .map(|m| format!(" (machine {m})"))
        .unwrap_or_default()
}
