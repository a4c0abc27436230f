//! Runtime façade and backend plumbing.
//!
//! Two backends share one surface: [`production`] executes handler runs on
//! host threads; the controlled backend in [`crate::lab`] serializes every
//! observable step for systematic exploration. Application code sees only
//! [`Runtime`], which dispatches to whichever backend is active.
//!
//! Backends implement the internal `RuntimeCore` capability trait
//! (create/send/assert/random/monitor); machines receive it through their
//! [`ActionCx`](crate::machine::ActionCx), so there is no ambient authority
//! and no cyclic ownership between runtime and machines.

pub mod production;
pub(crate) mod registry;

pub use production::ProductionRuntime;

use crate::config::RuntimeConfig;
use crate::coverage::CoverageReport;
use crate::error::{Failure, Result};
use crate::event::{Event, EventKind, OperationGroupId, SendOptions};
use crate::machine::core::{DynMachine, MachineCore};
use crate::machine::decl::DeclRegistry;
use crate::machine::MachineLogic;
use crate::monitor::MonitorRegistry;
use crate::types::{MachineId, MachineIdSource, MachineKind, StateName};
use parking_lot::Mutex;
use registry::MachineMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything needed to spawn a machine, with the concrete type erased.
pub(crate) struct MachineSpawn {
    pub(crate) type_name: &'static str,
    pub(crate) kind: MachineKind,
    pub(crate) friendly_name: Option<String>,
    /// A pre-allocated id from `create_machine_id`, for the bind path.
    pub(crate) predefined: Option<MachineId>,
    pub(crate) init: Option<Event>,
    pub(crate) op_group: OperationGroupId,
    pub(crate) make_core:
        Box<dyn FnOnce(&DeclRegistry, MachineId) -> Result<Box<dyn DynMachine>> + Send>,
}

impl MachineSpawn {
    /// Builds a spawn record for machine type `N`.
    pub(crate) fn of<N: MachineLogic + Default>(
        kind: MachineKind,
        friendly_name: Option<String>,
        init: Option<Event>,
        op_group: OperationGroupId,
    ) -> Self {
        Self {
            type_name: N::NAME,
            kind,
            friendly_name,
            predefined: None,
            init,
            op_group,
            make_core: Box::new(|decls, id| {
                let decl = decls.get_or_build::<N>()?;
                Ok(Box::new(MachineCore::new(id, decl, N::default())))
            }),
        }
    }

    /// Binds this spawn to a pre-allocated id.
    pub(crate) fn with_predefined(mut self, id: MachineId) -> Self {
        self.predefined = Some(id);
        self
    }
}

/// Type-erased monitor registration.
pub(crate) struct MonitorRegistration {
    pub(crate) type_name: &'static str,
    #[allow(clippy::type_complexity)]
    pub(crate) register: Box<
        dyn FnOnce(&dyn RuntimeCore, &DeclRegistry, &MonitorRegistry, MachineId) -> Result<()>
            + Send,
    >,
}

impl MonitorRegistration {
    pub(crate) fn of<M: MachineLogic + Default>() -> Self {
        Self {
            type_name: M::NAME,
            register: Box::new(|rt, decls, monitors, id| monitors.register::<M>(rt, decls, id)),
        }
    }
}

/// The backend capability surface.
///
/// Object-safe: generic machine types are erased into [`MachineSpawn`] and
/// [`MonitorRegistration`] by the façade and by `ActionCx`.
pub(crate) trait RuntimeCore: Send + Sync {
    /// Creates a machine asynchronously; returns once the id is allocated.
    fn spawn_machine(&self, spawn: MachineSpawn) -> Result<MachineId>;

    /// Creates a machine and drains its handler loop to quiescence on the
    /// calling thread.
    fn spawn_machine_and_execute(&self, spawn: MachineSpawn) -> Result<MachineId>;

    /// Allocates a fresh id without binding it to a machine.
    fn allocate_unbound_id(&self, type_name: &'static str, friendly: Option<&str>) -> MachineId;

    /// Enqueues `event` at `target`.
    fn send_from(&self, target: &MachineId, event: Event, options: &SendOptions) -> Result<()>;

    /// Enqueues and, when this call wins the handler-running flip, drains
    /// the target to quiescence. Returns true if the drain ran here.
    fn send_and_execute(
        &self,
        target: &MachineId,
        event: Event,
        options: &SendOptions,
    ) -> Result<bool>;

    /// Registers a monitor type (idempotent).
    fn register_monitor_raw(&self, registration: MonitorRegistration) -> Result<()>;

    /// Steps a registered monitor synchronously.
    fn invoke_monitor_by_name(&self, type_name: &'static str, event: &Event) -> Result<()>;

    /// Fails the execution when `condition` is false.
    fn check(&self, condition: bool, message: &str) -> Result<()>;

    /// Controlled boolean choice: true with probability `1/max`.
    fn next_boolean(&self, max: u32) -> Result<bool>;

    /// Controlled integer choice in `[0, max)`.
    fn next_integer(&self, max: u32) -> Result<i32>;

    /// Blocks the calling handler until an event of one of `kinds` arrives.
    fn receive_blocking(&self, mid: &MachineId, kinds: &[EventKind]) -> Result<Event>;

    /// The machine's current operation group. The controlled backend
    /// asserts the caller is `mid`.
    fn operation_group_of(&self, mid: &MachineId) -> Result<OperationGroupId>;

    /// Allocates a fresh non-empty operation group id.
    fn fresh_operation_group(&self) -> OperationGroupId;

    /// Coverage hook: a state was entered.
    fn record_state_visit(&self, machine_type: &'static str, state: StateName);

    /// Coverage hook: a transition fired.
    fn record_transition(
        &self,
        machine_type: &'static str,
        from: StateName,
        kind: EventKind,
        to: StateName,
    );

    /// Snapshot of the activity coverage recorded so far.
    fn coverage_snapshot(&self) -> CoverageReport;

    /// Blocks until no handler runs are active (production backend). The
    /// controlled backend is quiescent by construction between steps.
    fn wait_quiescent(&self);

    /// True for the controlled testing backend.
    fn is_controlled(&self) -> bool;
}

/// State common to both backends.
pub(crate) struct RuntimeShared {
    pub(crate) map: MachineMap,
    pub(crate) decls: DeclRegistry,
    pub(crate) monitors: MonitorRegistry,
    pub(crate) ids: MachineIdSource,
    /// Ids allocated by `create_machine_id` but not yet bound.
    unbound: Mutex<BTreeMap<(u64, u64), &'static str>>,
    op_groups: AtomicU64,
    coverage: Mutex<CoverageReport>,
    coverage_enabled: bool,
}

impl RuntimeShared {
    pub(crate) fn new(generation: u64, coverage_enabled: bool) -> Self {
        Self {
            map: MachineMap::new(),
            decls: DeclRegistry::new(),
            monitors: MonitorRegistry::new(),
            ids: MachineIdSource::new(generation),
            unbound: Mutex::new(BTreeMap::new()),
            op_groups: AtomicU64::new(1),
            coverage: Mutex::new(CoverageReport::new()),
            coverage_enabled,
        }
    }

    pub(crate) fn allocate_unbound(
        &self,
        type_name: &'static str,
        friendly: Option<&str>,
    ) -> MachineId {
        let id = self.ids.next(type_name, friendly, None);
        self.unbound
            .lock()
            .insert((id.generation(), id.value()), type_name);
        id
    }

    /// Resolves the id a spawn should use, enforcing bind-exactly-once and
    /// type agreement for predefined ids.
    pub(crate) fn resolve_spawn_id(&self, spawn: &MachineSpawn) -> Result<MachineId> {
        match &spawn.predefined {
            None => Ok(self.ids.next(
                spawn.type_name,
                spawn.friendly_name.as_deref(),
                None,
            )),
            Some(id) => {
                let mut unbound = self.unbound.lock();
                let Some(expected) = unbound.remove(&(id.generation(), id.value())) else {
                    return Err(Failure::DuplicateMachineId { id: id.clone() });
                };
                if expected != spawn.type_name {
                    unbound.insert((id.generation(), id.value()), expected);
                    return Err(Failure::TypeMismatch {
                        id: id.clone(),
                        expected,
                        actual: spawn.type_name,
                    });
                }
                Ok(id.clone())
            }
        }
    }

    pub(crate) fn fresh_operation_group(&self) -> OperationGroupId {
        OperationGroupId::from_raw(self.op_groups.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn record_state_visit(&self, machine_type: &'static str, state: StateName) {
        if self.coverage_enabled {
            self.coverage.lock().record_state(machine_type, state);
        }
    }

    pub(crate) fn record_transition(
        &self,
        machine_type: &'static str,
        from: StateName,
        kind: EventKind,
        to: StateName,
    ) {
        if self.coverage_enabled {
            self.coverage
                .lock()
                .record_transition(machine_type, from, kind, to);
        }
    }

    pub(crate) fn coverage_snapshot(&self) -> CoverageReport {
        self.coverage.lock().clone()
    }
}

/// Handle to the active runtime backend.
///
/// Cheap to clone; all methods are callable from any thread. Inside machine
/// actions, prefer the [`ActionCx`](crate::machine::ActionCx) surface, which
/// carries the machine's identity and operation group.
#[derive(Clone)]
pub struct Runtime {
    core: Arc<dyn RuntimeCore>,
}

impl Runtime {
    /// Creates a production runtime.
    #[must_use]
    pub fn production(config: RuntimeConfig) -> Self {
        Self {
            core: ProductionRuntime::new_arc(config),
        }
    }

    pub(crate) fn from_core(core: Arc<dyn RuntimeCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &dyn RuntimeCore {
        self.core.as_ref()
    }

    /// Creates a machine of type `M` asynchronously and returns its id.
    pub fn create_machine<M: MachineLogic + Default>(
        &self,
        init: Option<Event>,
    ) -> Result<MachineId> {
        self.core.spawn_machine(MachineSpawn::of::<M>(
            MachineKind::Regular,
            None,
            init,
            OperationGroupId::EMPTY,
        ))
    }

    /// Creates a machine whose initial work runs under `group`.
    ///
    /// The group rides on the init event and becomes the new machine's
    /// current operation group at start.
    pub fn create_machine_grouped<M: MachineLogic + Default>(
        &self,
        init: Option<Event>,
        group: OperationGroupId,
    ) -> Result<MachineId> {
        self.core.spawn_machine(MachineSpawn::of::<M>(
            MachineKind::Regular,
            None,
            init,
            group,
        ))
    }

    /// Creates a machine with a friendly name.
    pub fn create_machine_named<M: MachineLogic + Default>(
        &self,
        friendly_name: &str,
        init: Option<Event>,
    ) -> Result<MachineId> {
        self.core.spawn_machine(MachineSpawn::of::<M>(
            MachineKind::Regular,
            Some(friendly_name.to_owned()),
            init,
            OperationGroupId::EMPTY,
        ))
    }

    /// Creates a machine and drains it to quiescence before returning.
    pub fn create_machine_and_execute<M: MachineLogic + Default>(
        &self,
        init: Option<Event>,
    ) -> Result<MachineId> {
        self.core.spawn_machine_and_execute(MachineSpawn::of::<M>(
            MachineKind::Regular,
            None,
            init,
            OperationGroupId::EMPTY,
        ))
    }

    /// Allocates an id for type `M` without creating the machine.
    #[must_use]
    pub fn create_machine_id<M: MachineLogic>(&self, friendly_name: Option<&str>) -> MachineId {
        self.core.allocate_unbound_id(M::NAME, friendly_name)
    }

    /// Binds an id from [`Runtime::create_machine_id`] to a new machine.
    ///
    /// Fails with `DuplicateMachineId` if the id was already bound (or its
    /// machine has halted), and with `TypeMismatch` if `M` differs from the
    /// type the id was allocated for.
    pub fn bind<M: MachineLogic + Default>(
        &self,
        id: &MachineId,
        init: Option<Event>,
    ) -> Result<()> {
        self.core
            .spawn_machine(
                MachineSpawn::of::<M>(
                    MachineKind::Regular,
                    None,
                    init,
                    OperationGroupId::EMPTY,
                )
                .with_predefined(id.clone()),
            )
            .map(|_| ())
    }

    /// Enqueues `event` at `target`.
    pub fn send_event(&self, target: &MachineId, event: Event) -> Result<()> {
        self.core.send_from(target, event, &SendOptions::new())
    }

    /// Enqueues `event` with explicit options.
    pub fn send_event_with(
        &self,
        target: &MachineId,
        event: Event,
        options: SendOptions,
    ) -> Result<()> {
        self.core.send_from(target, event, &options)
    }

    /// Enqueues and drains the target to quiescence when possible.
    ///
    /// Returns true when the event was handled synchronously by this call,
    /// false when it was only enqueued (another handler run was active).
    pub fn send_event_and_execute(&self, target: &MachineId, event: Event) -> Result<bool> {
        self.core
            .send_and_execute(target, event, &SendOptions::new())
    }

    /// Registers a monitor of type `M`. Idempotent per type.
    pub fn register_monitor<M: MachineLogic + Default>(&self) -> Result<()> {
        self.core
            .register_monitor_raw(MonitorRegistration::of::<M>())
    }

    /// Steps the registered monitor of type `M` with `event`.
    pub fn invoke_monitor<M: MachineLogic>(&self, event: &Event) -> Result<()> {
        self.core.invoke_monitor_by_name(M::NAME, event)
    }

    /// Fails the execution when `condition` is false.
    pub fn assert(&self, condition: bool, message: &str) -> Result<()> {
        self.core.check(condition, message)
    }

    /// Controlled boolean choice: true with probability `1/max`.
    pub fn random_bool(&self, max: u32) -> Result<bool> {
        self.core.next_boolean(max)
    }

    /// Controlled integer choice in `[0, max)`.
    pub fn random_int(&self, max: u32) -> Result<i32> {
        self.core.next_integer(max)
    }

    /// The current operation group of machine `mid`.
    ///
    /// Under the controlled backend this asserts the caller is `mid`.
    pub fn operation_group_of(&self, mid: &MachineId) -> Result<OperationGroupId> {
        self.core.operation_group_of(mid)
    }

    /// Allocates a fresh operation group id.
    #[must_use]
    pub fn new_operation_group(&self) -> OperationGroupId {
        self.core.fresh_operation_group()
    }

    /// True when running under the controlled testing backend.
    #[must_use]
    pub fn is_controlled(&self) -> bool {
        self.core.is_controlled()
    }

    /// Snapshot of the activity coverage recorded so far.
    #[must_use]
    pub fn coverage_report(&self) -> CoverageReport {
        self.core.coverage_snapshot()
    }

    /// Blocks until no handler runs are active (production backend).
    pub fn wait_quiescent(&self) {
        self.core.wait_quiescent();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runtime({})",
            if self.is_controlled() {
                "controlled"
            } else {
                "production"
            }
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A no-op `RuntimeCore` for unit tests of machine cores and monitors.

    use super::*;
    use crate::util::DetRng;

    pub(crate) struct NullCore {
        rng: Mutex<DetRng>,
    }

    impl Default for NullCore {
        fn default() -> Self {
            Self {
                rng: Mutex::new(DetRng::new(7)),
            }
        }
    }

    impl RuntimeCore for NullCore {
        fn spawn_machine(&self, _spawn: MachineSpawn) -> Result<MachineId> {
            Err(Failure::assertion("NullCore cannot spawn machines"))
        }

        fn spawn_machine_and_execute(&self, spawn: MachineSpawn) -> Result<MachineId> {
            self.spawn_machine(spawn)
        }

        fn allocate_unbound_id(
            &self,
            type_name: &'static str,
            _friendly: Option<&str>,
        ) -> MachineId {
            MachineId::new_for_test(0, type_name)
        }

        fn send_from(
            &self,
            _target: &MachineId,
            _event: Event,
            _options: &SendOptions,
        ) -> Result<()> {
            Err(Failure::assertion("NullCore cannot send"))
        }

        fn send_and_execute(
            &self,
            _target: &MachineId,
            _event: Event,
            _options: &SendOptions,
        ) -> Result<bool> {
            Err(Failure::assertion("NullCore cannot send"))
        }

        fn register_monitor_raw(&self, _registration: MonitorRegistration) -> Result<()> {
            Ok(())
        }

        fn invoke_monitor_by_name(&self, _type_name: &str, _event: &Event) -> Result<()> {
            Ok(())
        }

        fn check(&self, condition: bool, message: &str) -> Result<()> {
            if condition {
                Ok(())
            } else {
                Err(Failure::assertion(message))
            }
        }

        fn next_boolean(&self, max: u32) -> Result<bool> {
            Ok(self.rng.lock().next_bool(max))
        }

        fn next_integer(&self, max: u32) -> Result<i32> {
            Ok(i32::try_from(self.rng.lock().next_bounded_u32(max)).unwrap_or(0))
        }

        fn receive_blocking(&self, _mid: &MachineId, _kinds: &[EventKind]) -> Result<Event> {
            Err(Failure::assertion("NullCore cannot receive"))
        }

        fn operation_group_of(&self, _mid: &MachineId) -> Result<OperationGroupId> {
            Ok(OperationGroupId::EMPTY)
        }

        fn fresh_operation_group(&self) -> OperationGroupId {
            OperationGroupId::from_raw(1)
        }

        fn record_state_visit(&self, _machine_type: &'static str, _state: StateName) {}

        fn record_transition(
            &self,
            _machine_type: &'static str,
            _from: StateName,
            _kind: EventKind,
            _to: StateName,
        ) {
        }

        fn coverage_snapshot(&self) -> CoverageReport {
            CoverageReport::new()
        }

        fn wait_quiescent(&self) {}

        fn is_controlled(&self) -> bool {
            false
        }
    }
}
