//! Machine execution engine.
//!
//! - [`decl`]: per-type state/handler declaration tables
//! - [`inbox`]: per-machine FIFO with deferred/ignored filtering
//! - [`core`]: state stack, handler run loop, transition primitives
//! - [`context`]: the capability context handed to actions
//!
//! A machine type is an ordinary struct implementing [`MachineLogic`]. The
//! runtime owns one [`MachineCell`] per live machine: the inbox (shared with
//! senders) and the core (owned by the single active handler run).

pub mod context;
pub mod core;
pub mod decl;
pub mod inbox;

pub use context::ActionCx;
pub use decl::{Action, DeclBuilder, MachineDecl, StateBuilder, StateDescriptor, Temperature};
pub use inbox::{DequeueFilter, DequeueOutcome, EnqueueOutcome, EventDisposition, Inbox};

use crate::types::{MachineId, MachineKind};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A machine type: state plus a declaration of states and handlers.
///
/// The struct's fields are the machine's private data; actions receive
/// `&mut self` and run one at a time, so no further synchronization is
/// needed inside a machine.
pub trait MachineLogic: Send + 'static {
    /// Machine type name, used in ids, logs, coverage, and traces.
    const NAME: &'static str;

    /// Declares the machine's states, handlers, and event filtering.
    fn configure(decl: &mut DeclBuilder<Self>)
    where
        Self: Sized;
}

/// Runtime record for one live machine.
///
/// The inbox is shared with senders under its own lock; the core is owned
/// exclusively by the active handler run. Lock order is core before inbox.
pub(crate) struct MachineCell {
    pub(crate) id: MachineId,
    pub(crate) kind: MachineKind,
    pub(crate) inbox: Mutex<Inbox>,
    /// Wakes a production handler parked in a blocking receive.
    pub(crate) resume: Condvar,
    pub(crate) core: Mutex<Box<dyn core::DynMachine>>,
    pub(crate) halted: AtomicBool,
    /// Hash of the state stack, mirrored out of the core for lock-free
    /// fingerprint reads at scheduling points.
    pub(crate) cached_state_hash: AtomicU64,
    /// Current operation group, mirrored for lock-free reads.
    pub(crate) cached_op_group: AtomicU64,
}

impl MachineCell {
    /// Creates a cell for a freshly spawned machine.
    ///
    /// The inbox starts with the running flag set: the creation path owns
    /// the first handler run, so racing senders only enqueue.
    pub(crate) fn new(
        id: MachineId,
        kind: MachineKind,
        core: Box<dyn core::DynMachine>,
    ) -> Self {
        let mut inbox = Inbox::new();
        inbox.set_running();
        let hash = core.state_hash();
        Self {
            id,
            kind,
            inbox: Mutex::new(inbox),
            resume: Condvar::new(),
            core: Mutex::new(core),
            halted: AtomicBool::new(false),
            cached_state_hash: AtomicU64::new(hash),
            cached_op_group: AtomicU64::new(0),
        }
    }

    /// True once the machine has halted.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Refreshes the mirrored state hash and operation group from the core,
    /// and installs the top state's dequeue filter in the inbox.
    ///
    /// Called by the handler run after `enter_start` and after every
    /// handled event, so enqueue-side checks always see the current state.
    pub(crate) fn refresh_cached(&self, core: &dyn core::DynMachine) {
        self.cached_state_hash
            .store(core.state_hash(), Ordering::Release);
        self.cached_op_group
            .store(core.operation_group().as_raw(), Ordering::Release);
        self.inbox.lock().set_filter(core.dequeue_filter());
    }

    /// Reads the mirrored state hash without touching the core lock.
    pub(crate) fn state_hash(&self) -> u64 {
        self.cached_state_hash.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MachineCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineCell")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("halted", &self.is_halted())
            .finish()
    }
}
