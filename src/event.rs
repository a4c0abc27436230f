//! Event values exchanged between machines.
//!
//! An [`Event`] is an opaque typed value: a kind tag shared by sender and
//! receiver, an optional payload, and routing metadata (origin, operation
//! group, send-step index, must-handle flag). Events are cheap to clone; the
//! payload is reference-counted.

use crate::types::MachineId;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The kind tag of an event.
///
/// Kinds are interned static strings compared by content, so the same kind
/// declared in two modules is one kind. Declare application kinds as
/// constants:
///
/// ```
/// use machina::EventKind;
/// const PING: EventKind = EventKind::new("Ping");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKind(&'static str);

impl EventKind {
    /// The halt event. Raising it halts the machine; a dequeued halt event
    /// with no handler halts the machine gracefully.
    pub const HALT: Self = Self("halt");

    /// The synthesized default event, dispatched when the inbox has nothing
    /// deliverable and some state on the stack declares a default handler.
    pub const DEFAULT: Self = Self("default");

    /// Sent by timer machines when a timer elapses.
    pub const TIMER_ELAPSED: Self = Self("timer_elapsed");

    /// Creates an event kind from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the kind name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKind({})", self.0)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An identifier propagated across causally related sends.
///
/// The id chosen at send time rides on the event; when the event is
/// dequeued it becomes the target machine's current operation group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OperationGroupId(u64);

impl OperationGroupId {
    /// The empty (absent) operation group.
    pub const EMPTY: Self = Self(0);

    /// Creates an operation group id from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the empty group.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for OperationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for OperationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "G-")
        } else {
            write!(f, "G{}", self.0)
        }
    }
}

/// Where an event came from: the sending machine and its state at send time.
#[derive(Debug, Clone)]
pub struct EventOrigin {
    /// The sending machine.
    pub sender: MachineId,
    /// Name of the sender's current state when the send happened.
    pub sender_state: &'static str,
}

/// Options controlling a send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Operation group to stamp on the event. `None` inherits the sender's
    /// current group (or stays empty for external sends).
    pub operation_group_id: Option<OperationGroupId>,
    /// Marks the event as must-handle: it may not be dropped, and a machine
    /// halting with it still enqueued is a bug.
    pub must_handle: bool,
}

impl SendOptions {
    /// Default options: inherit the sender's group, not must-handle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            operation_group_id: None,
            must_handle: false,
        }
    }

    /// Sets the operation group explicitly.
    #[must_use]
    pub const fn with_group(mut self, group: OperationGroupId) -> Self {
        self.operation_group_id = Some(group);
        self
    }

    /// Marks the event as must-handle.
    #[must_use]
    pub const fn must_handle(mut self) -> Self {
        self.must_handle = true;
        self
    }
}

/// An event: kind tag, optional payload, and metadata.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
    payload: Option<Arc<dyn Any + Send + Sync>>,
    /// Sender machine and state, when sent from inside a machine.
    pub(crate) origin: Option<EventOrigin>,
    /// Operation group riding on this event.
    pub(crate) op_group: OperationGroupId,
    /// Index assigned at enqueue; orders events per receiver.
    pub(crate) send_step: u64,
    /// Must-handle flag (see [`SendOptions::must_handle`]).
    pub(crate) must_handle: bool,
}

impl Event {
    /// Creates an event with no payload.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
            origin: None,
            op_group: OperationGroupId::EMPTY,
            send_step: 0,
            must_handle: false,
        }
    }

    /// Creates an event carrying a payload.
    #[must_use]
    pub fn with_payload<P: Any + Send + Sync>(kind: EventKind, payload: P) -> Self {
        let mut ev = Self::new(kind);
        ev.payload = Some(Arc::new(payload));
        ev
    }

    /// Returns the kind tag.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the payload downcast to `P`, if present and of that type.
    #[must_use]
    pub fn payload<P: Any + Send + Sync>(&self) -> Option<&P> {
        self.payload
            .as_deref()
            .and_then(|payload| payload.downcast_ref::<P>())
    }

    /// Returns the origin, when the event was sent from inside a machine.
    #[must_use]
    pub const fn origin(&self) -> Option<&EventOrigin> {
        self.origin.as_ref()
    }

    /// Returns the operation group riding on this event.
    #[must_use]
    pub const fn operation_group_id(&self) -> OperationGroupId {
        self.op_group
    }

    /// Returns the send-step index assigned at enqueue.
    #[must_use]
    pub const fn send_step(&self) -> u64 {
        self.send_step
    }

    /// Returns true if this event must be handled before its target halts.
    #[must_use]
    pub const fn is_must_handle(&self) -> bool {
        self.must_handle
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind.name())
            .field("op_group", &self.op_group)
            .field("send_step", &self.send_step)
            .field("must_handle", &self.must_handle)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
