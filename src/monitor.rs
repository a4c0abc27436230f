//! Specification monitors.
//!
//! A monitor is a passive observer machine: same declaration surface as a
//! regular machine (states, entry/exit, do-actions, goto, raise) but no
//! inbox: events arrive by synchronous invocation, interleaved inline with
//! the runtime call that delivers them. Monitors may not send, receive,
//! create machines, or use push/pop.
//!
//! Monitor states carry a [`Temperature`]: `hot` marks an open liveness
//! obligation, `cold` marks it discharged. The controlled scheduler reads
//! the current temperature for deadlock and cycle-based liveness checks.

use crate::error::{Failure, Result};
use crate::event::{Event, EventKind};
use crate::machine::core::{DynMachine, MachineCore};
use crate::machine::decl::{Binding, DeclRegistry, MachineDecl};
use crate::machine::{MachineLogic, Temperature};
use crate::runtime::RuntimeCore;
use crate::tracing_compat::{debug, trace};
use crate::types::{MachineId, StateName};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One registered monitor instance.
pub(crate) struct MonitorCell {
    type_name: &'static str,
    observes: BTreeSet<EventKind>,
    core: Mutex<Box<dyn DynMachine>>,
    /// Step index at which the monitor entered its current hot state, if it
    /// is hot. Maintained by the controlled scheduler's step counter;
    /// production passes zero.
    hot_since: Mutex<Option<u64>>,
}

impl MonitorCell {
    /// Current temperature.
    pub(crate) fn temperature(&self) -> Temperature {
        self.core.lock().temperature()
    }

    /// Current state name.
    pub(crate) fn current_state(&self) -> StateName {
        self.core.lock().current_state()
    }

    /// The monitor's type name.
    pub(crate) const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Step at which the monitor went hot, if it is hot.
    pub(crate) fn hot_since(&self) -> Option<u64> {
        *self.hot_since.lock()
    }

    /// Deterministic hash of the monitor's current state.
    pub(crate) fn state_hash(&self) -> u64 {
        self.core.lock().state_hash()
    }
}

/// Registry of monitors, shared by both backends.
///
/// Registration is idempotent per type. Iteration order is the type-name
/// order, so fingerprints and forwarding are deterministic.
#[derive(Default)]
pub(crate) struct MonitorRegistry {
    cells: Mutex<BTreeMap<&'static str, Arc<MonitorCell>>>,
}

impl MonitorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a monitor of type `M`, entering its start state.
    ///
    /// Re-registering an already-registered type is a no-op.
    pub(crate) fn register<M: MachineLogic + Default>(
        &self,
        rt: &dyn RuntimeCore,
        decls: &DeclRegistry,
        id: MachineId,
    ) -> Result<()> {
        {
            let cells = self.cells.lock();
            if cells.contains_key(M::NAME) {
                trace!(monitor = M::NAME, "monitor already registered");
                return Ok(());
            }
        }

        let decl = decls.get_or_build::<M>()?;
        validate_monitor_decl(&decl)?;
        let observes = decl.observes.clone();

        let mut core: Box<dyn DynMachine> =
            Box::new(MachineCore::new_monitor(id, decl, M::default()));
        core.enter_start(rt, None)?;
        let hot = core.temperature() == Temperature::Hot;

        let cell = Arc::new(MonitorCell {
            type_name: M::NAME,
            observes,
            core: Mutex::new(core),
            hot_since: Mutex::new(hot.then_some(0)),
        });

        let mut cells = self.cells.lock();
        // A concurrent registration of the same type wins harmlessly.
        cells.entry(M::NAME).or_insert(cell);
        debug!(monitor = M::NAME, "monitor registered");
        Ok(())
    }

    /// Steps the monitor named `type_name` with `event`.
    ///
    /// `step` is the scheduler's step counter (zero under production); it
    /// timestamps hot-state entry for cycle-based liveness detection.
    pub(crate) fn invoke(
        &self,
        rt: &dyn RuntimeCore,
        type_name: &str,
        event: &Event,
        step: u64,
    ) -> Result<()> {
        let cell = {
            let cells = self.cells.lock();
            cells.get(type_name).cloned()
        };
        let Some(cell) = cell else {
            return Err(Failure::assertion(format!(
                "monitor '{type_name}' is not registered"
            )));
        };
        Self::step_cell(&cell, rt, event, step)
    }

    /// Forwards `event` to every monitor observing its kind.
    pub(crate) fn forward(&self, rt: &dyn RuntimeCore, event: &Event, step: u64) -> Result<()> {
        let observers: Vec<Arc<MonitorCell>> = {
            let cells = self.cells.lock();
            cells
                .values()
                .filter(|cell| cell.observes.contains(&event.kind()))
                .cloned()
                .collect()
        };
        for cell in observers {
            Self::step_cell(&cell, rt, event, step)?;
        }
        Ok(())
    }

    fn step_cell(
        cell: &MonitorCell,
        rt: &dyn RuntimeCore,
        event: &Event,
        step: u64,
    ) -> Result<()> {
        let mut core = cell.core.lock();
        let was_hot = core.temperature() == Temperature::Hot;
        trace!(monitor = cell.type_name, kind = %event.kind(), "monitor step");
        core.handle_event(rt, event.clone())?;
        let is_hot = core.temperature() == Temperature::Hot;

        let mut hot_since = cell.hot_since.lock();
        match (was_hot, is_hot) {
            (false, true) => *hot_since = Some(step),
            (true, false) => *hot_since = None,
            _ => {}
        }
        Ok(())
    }

    /// Monitors currently in a hot state: `(type, state, hot_since_step)`.
    pub(crate) fn hot_monitors(&self) -> Vec<(&'static str, StateName, u64)> {
        let cells = self.cells.lock();
        cells
            .values()
            .filter_map(|cell| {
                if cell.temperature() == Temperature::Hot {
                    Some((
                        cell.type_name(),
                        cell.current_state(),
                        cell.hot_since().unwrap_or(0),
                    ))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Feeds every monitor's cached state into a fingerprint hasher, in
    /// type-name order.
    pub(crate) fn fingerprint_into(&self, hasher: &mut crate::util::DetHasher) {
        use std::hash::Hasher;
        let cells = self.cells.lock();
        for cell in cells.values() {
            hasher.write(cell.type_name.as_bytes());
            hasher.write_u64(cell.state_hash());
        }
    }

    /// Number of registered monitors.
    pub(crate) fn len(&self) -> usize {
        self.cells.lock().len()
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MonitorRegistry({} monitors)", self.len())
    }
}

/// Monitors have no inbox and no stack: push/pop bindings and deferred
/// sets make no sense for them and are rejected at registration.
fn validate_monitor_decl<M: MachineLogic>(decl: &MachineDecl<M>) -> Result<()> {
    for state in decl.states() {
        for binding in state.bindings.values() {
            if matches!(binding, Binding::Push(_) | Binding::Pop) {
                return Err(Failure::assertion(format!(
                    "monitor {} declares push/pop in state {}",
                    M::NAME,
                    state.name()
                )));
            }
        }
        if !state.deferred.is_empty() {
            return Err(Failure::assertion(format!(
                "monitor {} defers events in state {} but has no inbox",
                M::NAME,
                state.name()
            )));
        }
    }
    Ok(())
}
