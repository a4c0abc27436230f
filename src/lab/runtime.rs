//! The controlled runtime backend.
//!
//! Implements the runtime capability surface on top of the controlled
//! scheduler: every create, send, dequeue, receive, and nondeterministic
//! choice is a scheduling point. Each machine runs its handler loop on a
//! dedicated host thread gated by the scheduler, so the loop can block in
//! `receive` mid-action while the scheduler runs other operations.

use crate::config::TestConfig;
use crate::coverage::CoverageReport;
use crate::error::{Failure, Result};
use crate::event::{Event, EventKind, OperationGroupId, SendOptions};
use crate::lab::operation::{Gate, OpId, SchedulePointKind};
use crate::lab::scheduler::{ControlledScheduler, ProgramStateView};
use crate::machine::core::StepOutcome;
use crate::machine::inbox::{DequeueOutcome, EnqueueOutcome};
use crate::machine::MachineCell;
use crate::runtime::{MachineSpawn, MonitorRegistration, RuntimeCore, RuntimeShared};
use crate::tracing_compat::{debug, info, warn};
use crate::types::{CompactMachineId, MachineId, StateName};
use crate::util::det_hash::DetHasher;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

thread_local! {
    /// The operation the current thread is driving, if any.
    static CURRENT_OP: Cell<Option<(OpId, CompactMachineId)>> = const { Cell::new(None) };
}

/// Sets the thread-local current operation; used by machine threads and by
/// the engine for the harness operation.
pub(crate) fn set_current_op(op: Option<(OpId, CompactMachineId)>) {
    CURRENT_OP.with(|cell| cell.set(op));
}

fn current_op() -> Result<(OpId, CompactMachineId)> {
    CURRENT_OP.with(Cell::get).ok_or_else(|| {
        Failure::assertion("operation on the controlled runtime from an unmanaged thread")
    })
}

/// The controlled testing backend.
pub(crate) struct ControlledRuntime {
    pub(crate) shared: RuntimeShared,
    pub(crate) scheduler: Arc<ControlledScheduler>,
    config: TestConfig,
    /// Machine identity → its operation, for enabling on enqueue.
    ops_by_machine: Mutex<BTreeMap<(u64, u64), OpId>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl ControlledRuntime {
    pub(crate) fn new_arc(
        config: TestConfig,
        scheduler: Arc<ControlledScheduler>,
        generation: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            shared: RuntimeShared::new(generation, config.report_activity_coverage),
            scheduler,
            config,
            ops_by_machine: Mutex::new(BTreeMap::new()),
            threads: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        })
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("runtime outlives machine threads")
    }

    /// Joins all machine threads; called by the engine at iteration end.
    pub(crate) fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn op_of(&self, id: &MachineId) -> Option<OpId> {
        self.ops_by_machine
            .lock()
            .get(&(id.generation(), id.value()))
            .copied()
    }

    /// The dedicated thread loop of one machine.
    fn machine_thread(self: Arc<Self>, cell: Arc<MachineCell>, op: OpId, gate: Arc<Gate>, init: Option<Event>) {
        set_current_op(Some((op, CompactMachineId::from(&cell.id))));

        // Wait to be scheduled for the first time.
        gate.wait();
        if self.scheduler.is_canceled() {
            return;
        }

        let result = self.machine_loop(&cell, op, init);
        match result {
            Ok(()) => {}
            Err(failure) if failure.is_canceled() => {}
            Err(failure) => {
                self.scheduler.report_bug(failure);
            }
        }
    }

    fn machine_loop(&self, cell: &Arc<MachineCell>, op: OpId, init: Option<Event>) -> Result<()> {
        let mut core = cell.core.lock();

        let outcome = core
            .enter_start(self, init.as_ref())
            .map_err(|f| self.attribute(f, cell))?;
        cell.refresh_cached(&**core);
        if outcome == StepOutcome::Halted {
            drop(core);
            self.finish_halt(cell, op)?;
            return Ok(());
        }

        loop {
            // Scheduling point before each dequeue.
            self.scheduler.schedule(op, SchedulePointKind::Receive)?;

            let next = {
                let mut inbox = cell.inbox.lock();
                match inbox.try_dequeue(false) {
                    DequeueOutcome::Event(ev) => Some(ev),
                    DequeueOutcome::DefaultCandidate => {
                        let mut ev = Event::new(EventKind::DEFAULT);
                        ev.op_group = core.operation_group();
                        Some(ev)
                    }
                    DequeueOutcome::Empty => None,
                }
            };

            let Some(event) = next else {
                // Nothing deliverable: disabled until a sender re-enables us.
                self.scheduler.yield_idle(op)?;
                continue;
            };

            let outcome = core
                .handle_event(self, event)
                .map_err(|f| self.attribute(f, cell))?;
            cell.refresh_cached(&**core);
            if outcome == StepOutcome::Halted {
                drop(core);
                self.finish_halt(cell, op)?;
                return Ok(());
            }
        }
    }

    fn attribute(&self, failure: Failure, cell: &MachineCell) -> Failure {
        failure
            .attributed_to(&cell.id)
            .at_step(self.scheduler.steps())
    }

    /// Halt path: audit must-handle leftovers, drop from the map, complete
    /// the operation.
    fn finish_halt(&self, cell: &Arc<MachineCell>, op: OpId) -> Result<()> {
        let leftover = {
            let mut inbox = cell.inbox.lock();
            let leftover = inbox.first_must_handle();
            inbox.mark_halted();
            leftover
        };
        cell.halted.store(true, Ordering::Release);
        self.shared.map.remove(&cell.id);
        info!(machine = %cell.id, "machine halted");
        self.scheduler.complete(op);
        match leftover {
            Some(kind) => Err(Failure::MustHandle {
                machine: cell.id.clone(),
                kind,
            }),
            None => Ok(()),
        }
    }

    /// Enqueues at `target`, enabling its operation if the event is now
    /// deliverable (or was handed to a blocked receive).
    ///
    /// The inbox lock is released before touching the scheduler; inbox
    /// locks stay leaves of the lock order.
    fn enqueue_controlled(&self, cell: &Arc<MachineCell>, event: Event) -> Result<()> {
        let kind = event.kind();
        let (outcome, should_enable) = {
            let mut inbox = cell.inbox.lock();
            let outcome = inbox.enqueue(event);
            let should_enable = match outcome {
                EnqueueOutcome::DeliveredToReceiver => true,
                EnqueueOutcome::DroppedHalted => false,
                EnqueueOutcome::HandlerNotRunning | EnqueueOutcome::HandlerRunning => {
                    // A machine blocked in receive is only unblocked by a
                    // matching event, never by ordinary queue growth.
                    !inbox.is_waiting_to_receive() && inbox.has_work()
                }
            };
            (outcome, should_enable)
        };
        if should_enable {
            if let Some(target_op) = self.op_of(&cell.id) {
                self.scheduler.enable(target_op);
            }
        }
        if outcome == EnqueueOutcome::DroppedHalted {
            warn!(machine = %cell.id, kind = %kind, target_halted = true, "send raced a halt");
        }
        Ok(())
    }
}

impl ProgramStateView for ControlledRuntime {
    fn state_component_hash(&self) -> u64 {
        let mut hasher = DetHasher::default();
        for cell in self.shared.map.snapshot() {
            hasher.write_u64(cell.id.value());
            hasher.write_u64(cell.state_hash());
            // Queue contents distinguish states the stack alone cannot;
            // send-step counters are deliberately excluded so revisits can
            // actually match.
            let inbox = cell.inbox.lock();
            for kind in inbox.queued_kinds() {
                hasher.write(kind.name().as_bytes());
                hasher.write_u8(b';');
            }
            hasher.write_u8(u8::from(inbox.is_waiting_to_receive()));
        }
        self.shared.monitors.fingerprint_into(&mut hasher);
        hasher.finish()
    }

    fn hot_monitors(&self) -> Vec<(&'static str, StateName, u64)> {
        self.shared.monitors.hot_monitors()
    }
}

impl RuntimeCore for ControlledRuntime {
    fn spawn_machine(&self, spawn: MachineSpawn) -> Result<MachineId> {
        let (caller, _) = current_op()?;
        let id = self.shared.resolve_spawn_id(&spawn)?;
        let core = (spawn.make_core)(&self.shared.decls, id.clone())?;
        let cell = Arc::new(MachineCell::new(id.clone(), spawn.kind, core));
        if !self.shared.map.insert(cell.clone()) {
            return Err(Failure::DuplicateMachineId { id });
        }

        let init = spawn.init.map(|mut ev| {
            if ev.op_group.is_empty() {
                ev.op_group = spawn.op_group;
            }
            ev
        });

        let (op, gate) = self.scheduler.register_op(CompactMachineId::from(&id));
        self.ops_by_machine
            .lock()
            .insert((id.generation(), id.value()), op);

        let rt = self.arc_self();
        let handle = std::thread::Builder::new()
            .name(format!("machina-{}", id.value()))
            .spawn(move || rt.machine_thread(cell, op, gate, init))
            .map_err(|e| Failure::assertion(format!("failed to spawn machine thread: {e}")))?;
        self.threads.lock().push(handle);
        debug!(machine = %id, op = %op, "machine created");

        // Creation is itself a scheduling point for the creator.
        self.scheduler.schedule(caller, SchedulePointKind::Create)?;
        Ok(id)
    }

    fn spawn_machine_and_execute(&self, spawn: MachineSpawn) -> Result<MachineId> {
        // Under controlled scheduling, when the created machine runs is the
        // scheduler's decision; the synchronous variant is the same point.
        self.spawn_machine(spawn)
    }

    fn allocate_unbound_id(&self, type_name: &'static str, friendly: Option<&str>) -> MachineId {
        self.shared.allocate_unbound(type_name, friendly)
    }

    fn send_from(&self, target: &MachineId, event: Event, options: &SendOptions) -> Result<()> {
        let (caller, _) = current_op()?;
        // The runner suspends before each send.
        self.scheduler.schedule(caller, SchedulePointKind::Send)?;

        let mut event = event;
        if let Some(group) = options.operation_group_id {
            event.op_group = group;
        }
        event.must_handle = options.must_handle || self.config.must_handle_by_default;

        self.shared
            .monitors
            .forward(self, &event, self.scheduler.steps())?;

        match self.shared.map.get(target) {
            Some(cell) => self.enqueue_controlled(&cell, event),
            None => {
                warn!(machine = %target, kind = %event.kind(), target_halted = true, "send dropped");
                if event.must_handle {
                    return Err(Failure::MustHandle {
                        machine: target.clone(),
                        kind: event.kind(),
                    });
                }
                Ok(())
            }
        }
    }

    fn send_and_execute(
        &self,
        target: &MachineId,
        event: Event,
        options: &SendOptions,
    ) -> Result<bool> {
        // The scheduler owns when the target drains; the event is only
        // enqueued from the caller's point of view.
        self.send_from(target, event, options)?;
        Ok(false)
    }

    fn register_monitor_raw(&self, registration: MonitorRegistration) -> Result<()> {
        let id = self.shared.ids.next(registration.type_name, None, None);
        (registration.register)(self, &self.shared.decls, &self.shared.monitors, id)
    }

    fn invoke_monitor_by_name(&self, type_name: &str, event: &Event) -> Result<()> {
        self.shared
            .monitors
            .invoke(self, type_name, event, self.scheduler.steps())
    }

    fn check(&self, condition: bool, message: &str) -> Result<()> {
        if condition {
            return Ok(());
        }
        let mut failure = Failure::assertion(message).at_step(self.scheduler.steps());
        if let Ok((_, machine)) = current_op() {
            if let Some(cell) = self
                .shared
                .map
                .snapshot()
                .into_iter()
                .find(|cell| CompactMachineId::from(&cell.id) == machine)
            {
                failure = failure.attributed_to(&cell.id);
            }
        }
        Err(failure)
    }

    fn next_boolean(&self, max: u32) -> Result<bool> {
        self.scheduler.choice_boolean(max)
    }

    fn next_integer(&self, max: u32) -> Result<i32> {
        self.scheduler.choice_integer(max)
    }

    fn receive_blocking(&self, mid: &MachineId, kinds: &[EventKind]) -> Result<Event> {
        let (caller, _) = current_op()?;
        let Some(cell) = self.shared.map.get(mid) else {
            return Err(Failure::assertion(format!("receive on unknown machine {mid}")));
        };

        // Receive is a scheduling point whether or not it blocks.
        self.scheduler.schedule(caller, SchedulePointKind::Receive)?;

        {
            let mut inbox = cell.inbox.lock();
            if let Some(event) = inbox.begin_receive(kinds) {
                return Ok(event);
            }
        }
        debug!(machine = %mid, "blocked in receive");

        loop {
            self.scheduler.block_receive(caller)?;
            let mut inbox = cell.inbox.lock();
            if let Some(event) = inbox.take_delivered() {
                return Ok(event);
            }
            // Spuriously chosen before delivery; park again.
        }
    }

    fn operation_group_of(&self, mid: &MachineId) -> Result<OperationGroupId> {
        let (_, machine) = current_op()?;
        if machine != CompactMachineId::from(mid) {
            return Err(Failure::assertion(format!(
                "operation group of {mid} queried from a different machine"
            )));
        }
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
        // Quiescence is the scheduler's business between steps.
    }

    fn is_controlled(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for ControlledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledRuntime")
            .field("machines", &self.shared.map.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
