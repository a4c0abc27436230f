//! Schedulable operations and their gates.
//!
//! Under the controlled backend every machine (and the test harness) is one
//! *operation*. All operations run on real host threads, but each blocks on
//! its own [`Gate`]; the scheduler signals exactly one gate at a time, so
//! exactly one operation makes progress per step.

use crate::types::CompactMachineId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a schedulable operation within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// The kind of scheduling point an operation is passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulePointKind {
    /// Machine creation.
    Create,
    /// An event send.
    Send,
    /// An inbox dequeue or blocking receive.
    Receive,
    /// Operation completion (halt or harness return).
    Stop,
}

/// What the scheduler targets with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    /// A machine identity.
    Schedulable,
    /// A machine's inbox.
    Inbox,
}

/// Scheduler-visible status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Eligible to be scheduled.
    Enabled,
    /// Inbox has nothing deliverable; re-enabled by a matching enqueue.
    Idle,
    /// Blocked in `receive`; re-enabled when a predicate matches.
    WaitingReceive,
    /// The operation finished (machine halted or harness returned).
    Completed,
}

impl OpStatus {
    /// True if the scheduler may pick this operation.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// A binary gate: one waiter, one signaller, no lost signals.
#[derive(Debug, Default)]
pub struct Gate {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    /// Creates an unsignaled gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate for exactly one [`Gate::wait`].
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Blocks until signaled, then consumes the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }
}

/// One registered operation.
#[derive(Debug)]
pub(crate) struct OpRecord {
    pub(crate) id: OpId,
    /// Identity of the machine this operation drives.
    pub(crate) machine: CompactMachineId,
    pub(crate) gate: Arc<Gate>,
    pub(crate) status: OpStatus,
}

/// An enabled operation as presented to strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulableOp {
    /// Operation id.
    pub op: OpId,
    /// The machine it drives, for replay matching.
    pub machine: CompactMachineId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_passes_signal_before_wait() {
        let gate = Gate::new();
        gate.signal();
        gate.wait(); // returns immediately; signal was latched
    }

    #[test]
    fn gate_wakes_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(10));
        gate.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn status_enabled_predicate() {
        assert!(OpStatus::Enabled.is_enabled());
        assert!(!OpStatus::Idle.is_enabled());
        assert!(!OpStatus::WaitingReceive.is_enabled());
        assert!(!OpStatus::Completed.is_enabled());
    }
}
