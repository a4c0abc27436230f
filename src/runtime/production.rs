//! Production backend: parallel execution on host threads.
//!
//! Handler runs are dispatched to freshly spawned host threads. Per-machine
//! serialization comes from the inbox's handler-running flag: the sender
//! that flips it from not-running to running owes the machine a handler
//! run, the runner loops until nothing is deliverable, then clears the flag
//! atomically with the emptiness check.
//!
//! The `*_and_execute` variants run the drain on the caller's thread, so
//! their return means the target is quiescent or blocked in `receive`.
//!
//! A failure from any action halts the runtime: the first failure is
//! stored, the failure hook fires, parked receivers are woken, and
//! subsequent operations short-circuit with the stored failure.

use crate::config::RuntimeConfig;
use crate::coverage::CoverageReport;
use crate::error::{Failure, Result};
use crate::event::{Event, EventKind, OperationGroupId, SendOptions};
use crate::machine::inbox::{DequeueOutcome, EnqueueOutcome};
use crate::machine::MachineCell;
use crate::runtime::{MachineSpawn, MonitorRegistration, RuntimeCore, RuntimeShared};
use crate::tracing_compat::{debug, error, info, warn};
use crate::types::{MachineId, StateName};
use crate::util::DetRng;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

/// The production runtime.
pub struct ProductionRuntime {
    shared: RuntimeShared,
    config: RuntimeConfig,
    /// Runtime-scoped PRNG behind the nondeterministic-choice surface.
    rng: Mutex<DetRng>,
    /// First failure that halted the runtime.
    failed: Mutex<Option<Failure>>,
    /// Count of active handler runs, for quiescence waiting.
    active_runs: Mutex<usize>,
    quiescent: Condvar,
    /// Back-reference for handing the runtime to spawned pump threads.
    weak_self: Weak<Self>,
}

impl ProductionRuntime {
    /// Creates the runtime inside an `Arc` so pump threads can hold it.
    pub(crate) fn new_arc(config: RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            shared: RuntimeShared::new(1, config.report_activity_coverage),
            rng: Mutex::new(DetRng::new(config.seed)),
            config,
            failed: Mutex::new(None),
            active_runs: Mutex::new(0),
            quiescent: Condvar::new(),
            weak_self: weak.clone(),
        })
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("runtime outlives its pump threads")
    }

    fn short_circuit(&self) -> Result<()> {
        match &*self.failed.lock() {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    /// Records the first failure, fires the hook, and wakes parked
    /// receivers so their handler threads can unwind.
    fn fail(&self, failure: &Failure) {
        if failure.is_canceled() {
            return;
        }
        {
            let mut failed = self.failed.lock();
            if failed.is_some() {
                return;
            }
            *failed = Some(failure.clone());
        }
        error!(%failure, "runtime halted on failure");
        if let Some(hook) = &self.config.on_failure {
            hook(failure);
        }
        for cell in self.shared.map.snapshot() {
            let _inbox = cell.inbox.lock();
            cell.resume.notify_all();
        }
    }

    fn begin_run(&self) {
        *self.active_runs.lock() += 1;
    }

    fn end_run(&self) {
        let mut active = self.active_runs.lock();
        *active -= 1;
        if *active == 0 {
            self.quiescent.notify_all();
        }
    }

    /// Runs `cell`'s handler loop until nothing is deliverable.
    ///
    /// `enter` carries the init event for a machine's first run.
    fn pump(&self, cell: &Arc<MachineCell>, enter: Option<Option<Event>>) {
        let result = self.pump_inner(cell, enter);
        self.end_run();
        if let Err(failure) = result {
            self.fail(&failure);
        }
    }

    fn pump_inner(&self, cell: &Arc<MachineCell>, enter: Option<Option<Event>>) -> Result<()> {
        let mut core = cell.core.lock();

        if let Some(init) = enter {
            let outcome = core.enter_start(self, init.as_ref())?;
            cell.refresh_cached(&**core);
            if outcome == crate::machine::core::StepOutcome::Halted {
                drop(core);
                return self.finish_halt(cell);
            }
        }

        loop {
            if self.failed.lock().is_some() {
                return Err(Failure::Canceled);
            }

            let next = {
                let mut inbox = cell.inbox.lock();
                match inbox.try_dequeue(false) {
                    DequeueOutcome::Event(ev) => Some(ev),
                    DequeueOutcome::DefaultCandidate => {
                        let mut ev = Event::new(EventKind::DEFAULT);
                        ev.op_group = core.operation_group();
                        Some(ev)
                    }
                    DequeueOutcome::Empty => {
                        if inbox.try_idle() {
                            None
                        } else {
                            // A sender slipped in between the dequeue scan
                            // and the idle check; go around again.
                            continue;
                        }
                    }
                }
            };

            let Some(event) = next else {
                return Ok(());
            };

            let outcome = core.handle_event(self, event)?;
            cell.refresh_cached(&**core);
            if outcome == crate::machine::core::StepOutcome::Halted {
                drop(core);
                return self.finish_halt(cell);
            }
        }
    }

    /// Halt path: audit must-handle leftovers, drop from the map.
    fn finish_halt(&self, cell: &Arc<MachineCell>) -> Result<()> {
        let leftover = {
            let mut inbox = cell.inbox.lock();
            let leftover = inbox.first_must_handle();
            inbox.mark_halted();
            leftover
        };
        cell.halted.store(true, Ordering::Release);
        self.shared.map.remove(&cell.id);
        info!(machine = %cell.id, "machine halted");
        match leftover {
            Some(kind) => Err(Failure::MustHandle {
                machine: cell.id.clone(),
                kind,
            }),
            None => Ok(()),
        }
    }

    fn spawn_cell(&self, spawn: MachineSpawn) -> Result<(Arc<MachineCell>, Option<Event>)> {
        self.short_circuit()?;
        let id = self.shared.resolve_spawn_id(&spawn)?;
        let core = (spawn.make_core)(&self.shared.decls, id.clone())?;
        let cell = Arc::new(MachineCell::new(id.clone(), spawn.kind, core));
        if !self.shared.map.insert(cell.clone()) {
            return Err(Failure::DuplicateMachineId { id });
        }
        debug!(machine = %cell.id, "machine created");

        let init = spawn.init.map(|mut ev| {
            if ev.op_group.is_empty() {
                ev.op_group = spawn.op_group;
            }
            ev
        });
        Ok((cell, init))
    }

    fn resolve_send(
        &self,
        target: &MachineId,
        mut event: Event,
        options: &SendOptions,
    ) -> Result<Option<(Arc<MachineCell>, Event)>> {
        self.short_circuit()?;
        if let Some(group) = options.operation_group_id {
            event.op_group = group;
        }
        event.must_handle = options.must_handle;

        // Monitors observe the send whether or not the target is live.
        self.shared.monitors.forward(self, &event, 0)?;

        match self.shared.map.get(target) {
            Some(cell) => Ok(Some((cell, event))),
            None => {
                warn!(machine = %target, kind = %event.kind(), target_halted = true, "send dropped");
                if event.must_handle {
                    return Err(Failure::MustHandle {
                        machine: target.clone(),
                        kind: event.kind(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Enqueues; returns a cell when this call now owes a handler run.
    fn enqueue(&self, cell: &Arc<MachineCell>, event: Event) -> Option<Arc<MachineCell>> {
        let outcome = {
            let mut inbox = cell.inbox.lock();
            let outcome = inbox.enqueue(event);
            if outcome == EnqueueOutcome::DeliveredToReceiver {
                cell.resume.notify_one();
            }
            outcome
        };
        match outcome {
            EnqueueOutcome::HandlerNotRunning => Some(cell.clone()),
            EnqueueOutcome::DroppedHalted => {
                warn!(machine = %cell.id, target_halted = true, "send raced a halt");
                None
            }
            EnqueueOutcome::HandlerRunning | EnqueueOutcome::DeliveredToReceiver => None,
        }
    }
}

impl RuntimeCore for ProductionRuntime {
    fn spawn_machine(&self, spawn: MachineSpawn) -> Result<MachineId> {
        let (cell, init) = self.spawn_cell(spawn)?;
        let id = cell.id.clone();
        let rt = self.arc_self();
        self.begin_run();
        thread::spawn(move || rt.pump(&cell, Some(init)));
        Ok(id)
    }

    fn spawn_machine_and_execute(&self, spawn: MachineSpawn) -> Result<MachineId> {
        let (cell, init) = self.spawn_cell(spawn)?;
        let id = cell.id.clone();
        self.begin_run();
        self.pump(&cell, Some(init));
        self.short_circuit()?;
        Ok(id)
    }

    fn allocate_unbound_id(&self, type_name: &'static str, friendly: Option<&str>) -> MachineId {
        self.shared.allocate_unbound(type_name, friendly)
    }

    fn send_from(&self, target: &MachineId, event: Event, options: &SendOptions) -> Result<()> {
        let Some((cell, event)) = self.resolve_send(target, event, options)? else {
            return Ok(());
        };
        if let Some(cell) = self.enqueue(&cell, event) {
            let rt = self.arc_self();
            self.begin_run();
            thread::spawn(move || rt.pump(&cell, None));
        }
        Ok(())
    }

    fn send_and_execute(
        &self,
        target: &MachineId,
        event: Event,
        options: &SendOptions,
    ) -> Result<bool> {
        let Some((cell, event)) = self.resolve_send(target, event, options)? else {
            return Ok(false);
        };
        match self.enqueue(&cell, event) {
            Some(cell) => {
                self.begin_run();
                self.pump(&cell, None);
                self.short_circuit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn register_monitor_raw(&self, registration: MonitorRegistration) -> Result<()> {
        self.short_circuit()?;
        let id = self.shared.ids.next(registration.type_name, None, None);
        (registration.register)(self, &self.shared.decls, &self.shared.monitors, id)
    }

    fn invoke_monitor_by_name(&self, type_name: &str, event: &Event) -> Result<()> {
        self.short_circuit()?;
        let result = self.shared.monitors.invoke(self, type_name, event, 0);
        if let Err(failure) = &result {
            self.fail(failure);
        }
        result
    }

    fn check(&self, condition: bool, message: &str) -> Result<()> {
        if condition {
            return Ok(());
        }
        let failure = Failure::assertion(message);
        self.fail(&failure);
        Err(failure)
    }

    fn next_boolean(&self, max: u32) -> Result<bool> {
        self.short_circuit()?;
        Ok(self.rng.lock().next_bool(max))
    }

    fn next_integer(&self, max: u32) -> Result<i32> {
        self.short_circuit()?;
        let value = self.rng.lock().next_bounded_u32(max.max(1));
        Ok(i32::try_from(value).unwrap_or(i32::MAX))
    }

    fn receive_blocking(&self, mid: &MachineId, kinds: &[EventKind]) -> Result<Event> {
        let Some(cell) = self.shared.map.get(mid) else {
            return Err(Failure::assertion(format!("receive on unknown machine {mid}")));
        };
        let mut inbox = cell.inbox.lock();
        if let Some(event) = inbox.begin_receive(kinds) {
            return Ok(event);
        }
        debug!(machine = %mid, "blocked in receive");
        loop {
            cell.resume.wait(&mut inbox);
            if let Some(event) = inbox.take_delivered() {
                return Ok(event);
            }
            if self.failed.lock().is_some() {
                return Err(Failure::Canceled);
            }
        }
    }

    fn operation_group_of(&self, mid: &MachineId) -> Result<OperationGroupId> {
        let Some(cell) = self.shared.map.get(mid) else {
            return Err(Failure::assertion(format!("unknown machine {mid}")));
        };
        Ok(OperationGroupId::from_raw(
            cell.cached_op_group.load(Ordering::Acquire),
        ))
    }

    fn fresh_operation_group(&self) -> OperationGroupId {
        self.shared.fresh_operation_group()
    }

    fn record_state_visit(&self, machine_type: &'static str, state: StateName) {
        self.shared.record_state_visit(machine_type, state);
    }

    fn record_transition(
        &self,
        machine_type: &'static str,
        from: StateName,
        kind: EventKind,
        to: StateName,
    ) {
        self.shared.record_transition(machine_type, from, kind, to);
    }

    fn coverage_snapshot(&self) -> CoverageReport {
        self.shared.coverage_snapshot()
    }

    fn wait_quiescent(&self) {
        let mut active = self.active_runs.lock();
        while *active > 0 {
            self.quiescent.wait(&mut active);
        }
    }

    fn is_controlled(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for ProductionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionRuntime")
            .field("machines", &self.shared.map.len())
            .field("failed", &self.failed.lock().is_some())
            .finish()
    }
}
