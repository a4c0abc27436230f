//! Per-machine inbox.
//!
//! A FIFO of events with the dispatch bookkeeping the runtime needs:
//!
//! - the handler-running flag, flipped atomically with enqueue so exactly
//!   one runner exists per machine;
//! - deferred/ignored filtering at dequeue, driven by a [`DequeueFilter`]
//!   snapshot of the top state's declaration (the runner refreshes it after
//!   every state change, so senders and schedulers can classify without
//!   touching the machine core);
//! - blocking-receive predicates and direct delivery to a waiting receiver;
//! - the must-handle audit run when the machine halts.

use crate::event::{Event, EventKind};
use std::collections::{BTreeSet, VecDeque};

/// How the top state treats an event kind at dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Dequeue and dispatch.
    Handle,
    /// Leave in the inbox until a state change.
    Defer,
    /// Drop at dequeue.
    Ignore,
}

/// Snapshot of the top state's event filtering.
///
/// Rebuilt by the handler run after every state change and stored in the
/// inbox, so enqueue-side eligibility checks never need the machine core.
#[derive(Debug, Clone, Default)]
pub struct DequeueFilter {
    /// Kinds the top state defers.
    pub deferred: BTreeSet<EventKind>,
    /// Kinds the top state ignores.
    pub ignored: BTreeSet<EventKind>,
    /// True if any state on the stack binds the default event.
    pub has_default: bool,
}

impl DequeueFilter {
    /// Disposition of `kind`. Must-handle overrides both deferral and
    /// ignoring: such an event may neither wait past a halt nor be dropped.
    #[must_use]
    pub fn classify(&self, kind: EventKind, must_handle: bool) -> EventDisposition {
        if must_handle {
            return EventDisposition::Handle;
        }
        if self.ignored.contains(&kind) {
            EventDisposition::Ignore
        } else if self.deferred.contains(&kind) {
            EventDisposition::Defer
        } else {
            EventDisposition::Handle
        }
    }
}

/// Result of an enqueue, telling the sender what it now owes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The handler was not running; the flag is now flipped and the caller
    /// is obliged to schedule a handler run.
    HandlerNotRunning,
    /// A handler run is already active (or scheduled); nothing to do.
    HandlerRunning,
    /// The event matched a blocking receive; the caller must resume the
    /// waiting machine instead of scheduling a handler run.
    DeliveredToReceiver,
    /// The machine has halted; the event was dropped.
    DroppedHalted,
}

/// Result of a dequeue attempt.
#[derive(Debug)]
pub enum DequeueOutcome {
    /// A deliverable event.
    Event(Event),
    /// Nothing deliverable and no default handler applies.
    Empty,
    /// Nothing deliverable, but the state stack declares a default handler;
    /// the caller should synthesize a `default` event.
    DefaultCandidate,
}

/// Per-machine event queue with dispatch bookkeeping.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<Event>,
    filter: DequeueFilter,
    running: bool,
    halted: bool,
    waiting_for: Option<Vec<EventKind>>,
    delivered: Option<Event>,
    next_send_step: u64,
    dequeue_cursor: u64,
}

impl Inbox {
    /// Creates an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the current top state's filter snapshot.
    pub fn set_filter(&mut self, filter: DequeueFilter) {
        self.filter = filter;
    }

    /// Appends an event, stamping its send step.
    ///
    /// If the machine is blocked in `receive` and the event matches a
    /// predicate, the event is handed to the receiver directly and never
    /// enters the queue.
    pub fn enqueue(&mut self, mut event: Event) -> EnqueueOutcome {
        if self.halted {
            return EnqueueOutcome::DroppedHalted;
        }
        event.send_step = self.next_send_step;
        self.next_send_step += 1;

        if let Some(kinds) = &self.waiting_for {
            if kinds.contains(&event.kind()) && self.delivered.is_none() {
                self.delivered = Some(event);
                self.waiting_for = None;
                return EnqueueOutcome::DeliveredToReceiver;
            }
        }

        self.queue.push_back(event);
        if self.running {
            EnqueueOutcome::HandlerRunning
        } else {
            self.running = true;
            EnqueueOutcome::HandlerNotRunning
        }
    }

    /// Scans from the head for the first deliverable event, dropping
    /// ignored events along the way. When nothing is deliverable and the
    /// filter declares a default handler, returns
    /// [`DequeueOutcome::DefaultCandidate`].
    pub fn try_dequeue(&mut self, peek_only: bool) -> DequeueOutcome {
        let mut index = 0;
        while index < self.queue.len() {
            let (kind, must_handle) = {
                let ev = &self.queue[index];
                (ev.kind(), ev.is_must_handle())
            };
            match self.filter.classify(kind, must_handle) {
                EventDisposition::Ignore => {
                    // Dropped at dequeue; the scan continues at this index.
                    self.queue.remove(index);
                }
                EventDisposition::Defer => {
                    index += 1;
                }
                EventDisposition::Handle => {
                    if peek_only {
                        let ev = self.queue[index].clone();
                        return DequeueOutcome::Event(ev);
                    }
                    let ev = self.queue.remove(index).expect("index in bounds");
                    self.dequeue_cursor = ev.send_step();
                    return DequeueOutcome::Event(ev);
                }
            }
        }
        if self.filter.has_default {
            DequeueOutcome::DefaultCandidate
        } else {
            DequeueOutcome::Empty
        }
    }

    /// True if the current filter would deliver some queued event, or the
    /// stack declares a default handler (the machine always has work then).
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.filter.has_default
            || self
                .queue
                .iter()
                .any(|ev| {
                    self.filter.classify(ev.kind(), ev.is_must_handle())
                        == EventDisposition::Handle
                })
    }

    /// Begins a blocking receive: takes a matching event if one is queued,
    /// else records the predicates for [`Inbox::enqueue`] to match against.
    ///
    /// Receive predicates override deferral: a matching event is taken from
    /// anywhere in the queue regardless of the top state's deferred set.
    pub fn begin_receive(&mut self, kinds: &[EventKind]) -> Option<Event> {
        if let Some(position) = self.queue.iter().position(|ev| kinds.contains(&ev.kind())) {
            let ev = self.queue.remove(position).expect("position in bounds");
            return Some(ev);
        }
        self.waiting_for = Some(kinds.to_vec());
        None
    }

    /// Takes the event delivered to a waiting receiver, if any.
    pub fn take_delivered(&mut self) -> Option<Event> {
        self.delivered.take()
    }

    /// True if the machine is blocked in `receive`.
    #[must_use]
    pub const fn is_waiting_to_receive(&self) -> bool {
        self.waiting_for.is_some()
    }

    /// True if an event has been handed to the waiting receiver but not yet
    /// consumed.
    #[must_use]
    pub const fn has_delivered(&self) -> bool {
        self.delivered.is_some()
    }

    /// True while a handler run is active or scheduled.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Clears the running flag if nothing is deliverable.
    ///
    /// Must be called under the same lock as [`Inbox::enqueue`] so a racing
    /// sender either sees the flag still set or finds it cleared and
    /// schedules a run itself. Returns `true` if the machine went idle.
    pub fn try_idle(&mut self) -> bool {
        if self.has_work() {
            return false;
        }
        self.running = false;
        true
    }

    /// Re-arms the running flag; used at machine creation and by schedulers
    /// that resume a machine without going through [`Inbox::enqueue`].
    pub fn set_running(&mut self) {
        self.running = true;
    }

    /// Marks the machine halted. Subsequent enqueues are dropped.
    pub fn mark_halted(&mut self) {
        self.halted = true;
        self.running = false;
        self.waiting_for = None;
    }

    /// True once the machine has halted.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// Returns the kind of the first must-handle event still enqueued.
    ///
    /// Called on the halt path: a `Some` here is a bug.
    #[must_use]
    pub fn first_must_handle(&self) -> Option<EventKind> {
        self.queue
            .iter()
            .find(|ev| ev.is_must_handle())
            .map(Event::kind)
    }

    /// Kinds of the queued events, in queue order. Part of the controlled
    /// scheduler's program-state fingerprint.
    pub fn queued_kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.queue.iter().map(Event::kind)
    }

    /// Number of queued events (excludes a delivered-but-unconsumed one).
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Send step the last dequeued event carried.
    #[must_use]
    pub const fn dequeue_cursor(&self) -> u64 {
        self.dequeue_cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const X: EventKind = EventKind::new("X");
    const Y: EventKind = EventKind::new("Y");
    const Z: EventKind = EventKind::new("Z");

    fn filter(deferred: &[EventKind], ignored: &[EventKind]) -> DequeueFilter {
        DequeueFilter {
            deferred: deferred.iter().copied().collect(),
            ignored: ignored.iter().copied().collect(),
            has_default: false,
        }
    }

    #[test]
    fn enqueue_flips_running_once() {
        let mut inbox = Inbox::new();
        assert_eq!(
            inbox.enqueue(Event::new(X)),
            EnqueueOutcome::HandlerNotRunning
        );
        assert_eq!(inbox.enqueue(Event::new(Y)), EnqueueOutcome::HandlerRunning);
        assert!(inbox.is_running());
    }

    #[test]
    fn dequeue_in_send_order() {
        let mut inbox = Inbox::new();
        inbox.enqueue(Event::new(X));
        inbox.enqueue(Event::new(Y));

        let DequeueOutcome::Event(first) = inbox.try_dequeue(false) else {
            panic!("expected event");
        };
        assert_eq!(first.kind(), X);
        assert_eq!(first.send_step(), 0);

        let DequeueOutcome::Event(second) = inbox.try_dequeue(false) else {
            panic!("expected event");
        };
        assert_eq!(second.kind(), Y);
        assert_eq!(second.send_step(), 1);
    }

    #[test]
    fn deferred_events_are_skipped_not_dropped() {
        let mut inbox = Inbox::new();
        inbox.set_filter(filter(&[X], &[]));
        inbox.enqueue(Event::new(X));
        inbox.enqueue(Event::new(Y));

        let DequeueOutcome::Event(ev) = inbox.try_dequeue(false) else {
            panic!("expected Y");
        };
        assert_eq!(ev.kind(), Y);
        assert_eq!(inbox.len(), 1);

        // A state change clears the deferral; X becomes deliverable.
        inbox.set_filter(filter(&[], &[]));
        let DequeueOutcome::Event(ev) = inbox.try_dequeue(false) else {
            panic!("expected X");
        };
        assert_eq!(ev.kind(), X);
    }

    #[test]
    fn must_handle_overrides_defer() {
        let mut inbox = Inbox::new();
        inbox.set_filter(filter(&[X], &[]));
        let mut critical = Event::new(X);
        critical.must_handle = true;
        inbox.enqueue(critical);

        let DequeueOutcome::Event(ev) = inbox.try_dequeue(false) else {
            panic!("must-handle event should bypass deferral");
        };
        assert!(ev.is_must_handle());
    }

    #[test]
    fn ignored_events_are_dropped() {
        let mut inbox = Inbox::new();
        inbox.set_filter(filter(&[], &[Z]));
        inbox.enqueue(Event::new(Z));
        inbox.enqueue(Event::new(X));

        let DequeueOutcome::Event(ev) = inbox.try_dequeue(false) else {
            panic!("expected X");
        };
        assert_eq!(ev.kind(), X);
        assert!(inbox.is_empty());
    }

    #[test]
    fn default_candidate_when_nothing_deliverable() {
        let mut inbox = Inbox::new();
        assert!(matches!(inbox.try_dequeue(false), DequeueOutcome::Empty));

        inbox.set_filter(DequeueFilter {
            has_default: true,
            ..DequeueFilter::default()
        });
        assert!(matches!(
            inbox.try_dequeue(false),
            DequeueOutcome::DefaultCandidate
        ));
    }

    #[test]
    fn receive_takes_from_anywhere_in_queue() {
        let mut inbox = Inbox::new();
        inbox.enqueue(Event::new(X));
        inbox.enqueue(Event::new(Y));

        let ev = inbox.begin_receive(&[Y]).expect("Y is queued");
        assert_eq!(ev.kind(), Y);
        assert!(!inbox.is_waiting_to_receive());
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn receive_blocks_then_enqueue_delivers() {
        let mut inbox = Inbox::new();
        inbox.set_running(); // receive is only reachable from inside a handler run
        assert!(inbox.begin_receive(&[Y]).is_none());
        assert!(inbox.is_waiting_to_receive());

        // A non-matching send queues normally.
        assert_eq!(
            inbox.enqueue(Event::new(X)),
            EnqueueOutcome::HandlerRunning,
            "machine is mid-handler while blocked in receive"
        );

        // The matching send goes straight to the receiver.
        assert_eq!(
            inbox.enqueue(Event::new(Y)),
            EnqueueOutcome::DeliveredToReceiver
        );
        let ev = inbox.take_delivered().expect("delivered");
        assert_eq!(ev.kind(), Y);
        assert!(!inbox.is_waiting_to_receive());
    }

    #[test]
    fn halted_inbox_drops_enqueues() {
        let mut inbox = Inbox::new();
        inbox.mark_halted();
        assert_eq!(inbox.enqueue(Event::new(X)), EnqueueOutcome::DroppedHalted);
        assert!(inbox.is_empty());
    }

    #[test]
    fn must_handle_audit_finds_leftovers() {
        let mut inbox = Inbox::new();
        inbox.enqueue(Event::new(X));
        let mut critical = Event::new(Y);
        critical.must_handle = true;
        inbox.enqueue(critical);

        assert_eq!(inbox.first_must_handle(), Some(Y));
    }

    #[test]
    fn try_idle_refuses_with_deliverable_work() {
        let mut inbox = Inbox::new();
        inbox.enqueue(Event::new(X));
        assert!(!inbox.try_idle());
        assert!(inbox.is_running());

        let _ = inbox.try_dequeue(false);
        assert!(inbox.try_idle());
        assert!(!inbox.is_running());
    }

    #[test]
    fn peek_leaves_the_event_queued() {
        let mut inbox = Inbox::new();
        inbox.enqueue(Event::new(X));

        let DequeueOutcome::Event(peeked) = inbox.try_dequeue(true) else {
            panic!("expected a peeked event");
        };
        assert_eq!(peeked.kind(), X);
        assert_eq!(inbox.len(), 1, "peek does not consume");

        let DequeueOutcome::Event(taken) = inbox.try_dequeue(false) else {
            panic!("expected the same event");
        };
        assert_eq!(taken.kind(), X);
        assert!(inbox.is_empty());
    }

    #[test]
    fn default_handler_means_always_work() {
        let mut inbox = Inbox::new();
        inbox.set_filter(DequeueFilter {
            has_default: true,
            ..DequeueFilter::default()
        });
        assert!(inbox.has_work());
        assert!(!inbox.try_idle());
    }
}
