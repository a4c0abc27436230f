//! Machine type declarations.
//!
//! Each machine type builds an immutable [`MachineDecl`] exactly once: a
//! table of [`StateDescriptor`]s keyed by state name, with handlers,
//! transitions, and deferred/ignored sets per (state, event). Lookup at
//! runtime is a map access; there is no reflection on hot paths.
//!
//! Declarations use the builder surface from
//! [`MachineLogic::configure`](crate::machine::MachineLogic::configure):
//!
//! ```
//! use machina::{DeclBuilder, Event, EventKind, MachineLogic};
//!
//! const PING: EventKind = EventKind::new("Ping");
//!
//! #[derive(Default)]
//! struct Server;
//!
//! impl MachineLogic for Server {
//!     const NAME: &'static str = "Server";
//!
//!     fn configure(decl: &mut DeclBuilder<Self>) {
//!         decl.state("Active")
//!             .start()
//!             .on(PING, |_m, cx, ev| {
//!                 let _ = ev;
//!                 cx.halt()
//!             });
//!     }
//! }
//! ```

use crate::error::{Failure, Result};
use crate::event::{Event, EventKind};
use crate::machine::context::ActionCx;
use crate::machine::MachineLogic;
use crate::types::StateName;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// An action closure: runs with exclusive access to the machine's state and
/// a capability context for transitions, sends, and assertions.
pub type Action<M> = Arc<dyn Fn(&mut M, &mut ActionCx<'_>, &Event) -> Result<()> + Send + Sync>;

/// Liveness temperature of a monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Temperature {
    /// No liveness obligation.
    #[default]
    Neutral,
    /// A liveness obligation is open; staying here forever is a bug.
    Hot,
    /// The obligation has been discharged.
    Cold,
}

/// What a (state, event) pair is declared to do.
pub(crate) enum Binding<M> {
    /// Run an action in place.
    Do(Action<M>),
    /// Transition to a state, optionally running an action first.
    Goto(StateName, Option<Action<M>>),
    /// Push a state onto the stack.
    Push(StateName),
    /// Pop the current state.
    Pop,
}

impl<M> Clone for Binding<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Do(a) => Self::Do(a.clone()),
            Self::Goto(s, a) => Self::Goto(*s, a.clone()),
            Self::Push(s) => Self::Push(*s),
            Self::Pop => Self::Pop,
        }
    }
}

impl<M> fmt::Debug for Binding<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Do(_) => f.write_str("Do"),
            Self::Goto(s, a) => write!(f, "Goto({s}, action={})", a.is_some()),
            Self::Push(s) => write!(f, "Push({s})"),
            Self::Pop => f.write_str("Pop"),
        }
    }
}

/// Per-(machine-type, state) descriptor: actions, transitions, and event
/// filtering sets.
pub struct StateDescriptor<M> {
    pub(crate) name: StateName,
    pub(crate) is_start: bool,
    pub(crate) temperature: Temperature,
    pub(crate) entry: Option<Action<M>>,
    pub(crate) exit: Option<Action<M>>,
    pub(crate) bindings: BTreeMap<EventKind, Binding<M>>,
    pub(crate) deferred: BTreeSet<EventKind>,
    pub(crate) ignored: BTreeSet<EventKind>,
}

impl<M> StateDescriptor<M> {
    fn new(name: StateName) -> Self {
        Self {
            name,
            is_start: false,
            temperature: Temperature::Neutral,
            entry: None,
            exit: None,
            bindings: BTreeMap::new(),
            deferred: BTreeSet::new(),
            ignored: BTreeSet::new(),
        }
    }

    /// Returns the state name.
    #[must_use]
    pub const fn name(&self) -> StateName {
        self.name
    }

    /// Returns the declared temperature (monitors only).
    #[must_use]
    pub const fn temperature(&self) -> Temperature {
        self.temperature
    }

    /// True if this state declares any binding for `kind`.
    #[must_use]
    pub fn handles(&self, kind: EventKind) -> bool {
        self.bindings.contains_key(&kind)
    }

    /// True if this state defers `kind`.
    #[must_use]
    pub fn defers(&self, kind: EventKind) -> bool {
        self.deferred.contains(&kind)
    }

    /// True if this state ignores `kind`.
    #[must_use]
    pub fn ignores(&self, kind: EventKind) -> bool {
        self.ignored.contains(&kind)
    }
}

impl<M> fmt::Debug for StateDescriptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.name)
            .field("is_start", &self.is_start)
            .field("temperature", &self.temperature)
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("deferred", &self.deferred)
            .field("ignored", &self.ignored)
            .finish()
    }
}

/// The immutable per-type declaration table.
pub struct MachineDecl<M> {
    pub(crate) type_name: &'static str,
    pub(crate) start: StateName,
    pub(crate) states: BTreeMap<StateName, StateDescriptor<M>>,
    /// Event kinds a monitor observes; empty for regular machines.
    pub(crate) observes: BTreeSet<EventKind>,
}

impl<M: MachineLogic> MachineDecl<M> {
    /// Builds and validates the declaration for `M`.
    pub fn build() -> Result<Self> {
        let mut builder = DeclBuilder {
            states: BTreeMap::new(),
            observes: BTreeSet::new(),
        };
        M::configure(&mut builder);
        builder.finish(M::NAME)
    }
}

impl<M> MachineDecl<M> {
    /// Returns the machine type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the declared start state.
    #[must_use]
    pub const fn start_state(&self) -> StateName {
        self.start
    }

    /// Looks up a state descriptor.
    #[must_use]
    pub fn state(&self, name: StateName) -> Option<&StateDescriptor<M>> {
        self.states.get(&name)
    }

    /// Iterates declared states in name order.
    pub fn states(&self) -> impl Iterator<Item = &StateDescriptor<M>> {
        self.states.values()
    }

    /// True if a monitor of this type observes `kind`.
    #[must_use]
    pub fn observes(&self, kind: EventKind) -> bool {
        self.observes.contains(&kind)
    }
}

impl<M> fmt::Debug for MachineDecl<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineDecl")
            .field("type_name", &self.type_name)
            .field("start", &self.start)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder passed to [`MachineLogic::configure`].
pub struct DeclBuilder<M> {
    states: BTreeMap<StateName, StateDescriptor<M>>,
    observes: BTreeSet<EventKind>,
}

impl<M: MachineLogic> DeclBuilder<M> {
    /// Opens (or reopens) a state for configuration.
    pub fn state(&mut self, name: impl Into<StateName>) -> StateBuilder<'_, M> {
        let name = name.into();
        let descriptor = self
            .states
            .entry(name)
            .or_insert_with(|| StateDescriptor::new(name));
        StateBuilder { descriptor }
    }

    /// Declares the event kinds this type observes when registered as a
    /// monitor. Sends of these kinds are forwarded to the monitor.
    pub fn observes(&mut self, kinds: &[EventKind]) -> &mut Self {
        self.observes.extend(kinds.iter().copied());
        self
    }

    fn finish(self, type_name: &'static str) -> Result<MachineDecl<M>> {
        let mut start = None;
        for descriptor in self.states.values() {
            if descriptor.is_start {
                if let Some(previous) = start {
                    return Err(Failure::assertion(format!(
                        "{type_name}: multiple start states ({previous} and {})",
                        descriptor.name
                    )));
                }
                start = Some(descriptor.name);
            }
            for binding in descriptor.bindings.values() {
                let target = match binding {
                    Binding::Goto(target, _) | Binding::Push(target) => *target,
                    Binding::Do(_) | Binding::Pop => continue,
                };
                if !self.states.contains_key(&target) {
                    return Err(Failure::assertion(format!(
                        "{type_name}: state {} targets undeclared state {target}",
                        descriptor.name
                    )));
                }
            }
        }
        let Some(start) = start else {
            return Err(Failure::assertion(format!(
                "{type_name}: no start state declared"
            )));
        };
        Ok(MachineDecl {
            type_name,
            start,
            states: self.states,
            observes: self.observes,
        })
    }
}

/// Configures a single state.
pub struct StateBuilder<'a, M> {
    descriptor: &'a mut StateDescriptor<M>,
}

impl<M: MachineLogic> StateBuilder<'_, M> {
    /// Marks this state as the start state. Exactly one state must be.
    pub fn start(&mut self) -> &mut Self {
        self.descriptor.is_start = true;
        self
    }

    /// Marks this state hot (monitors: liveness obligation open).
    pub fn hot(&mut self) -> &mut Self {
        self.descriptor.temperature = Temperature::Hot;
        self
    }

    /// Marks this state cold (monitors: obligation discharged).
    pub fn cold(&mut self) -> &mut Self {
        self.descriptor.temperature = Temperature::Cold;
        self
    }

    /// Sets the entry action.
    pub fn on_entry<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionCx<'_>, &Event) -> Result<()> + Send + Sync + 'static,
    {
        self.descriptor.entry = Some(Arc::new(action));
        self
    }

    /// Sets the exit action. Transition statements are forbidden inside it.
    pub fn on_exit<F>(&mut self, action: F) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionCx<'_>, &Event) -> Result<()> + Send + Sync + 'static,
    {
        self.descriptor.exit = Some(Arc::new(action));
        self
    }

    /// Declares a do-action for `kind`.
    pub fn on<F>(&mut self, kind: EventKind, action: F) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionCx<'_>, &Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bind(kind, Binding::Do(Arc::new(action)))
    }

    /// Declares a goto-transition for `kind`.
    pub fn on_goto(&mut self, kind: EventKind, target: impl Into<StateName>) -> &mut Self {
        self.bind(kind, Binding::Goto(target.into(), None))
    }

    /// Declares a goto-transition that runs `action` before the transition.
    pub fn on_goto_with<F>(
        &mut self,
        kind: EventKind,
        target: impl Into<StateName>,
        action: F,
    ) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionCx<'_>, &Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bind(kind, Binding::Goto(target.into(), Some(Arc::new(action))))
    }

    /// Declares a push-transition for `kind`.
    pub fn on_push(&mut self, kind: EventKind, target: impl Into<StateName>) -> &mut Self {
        self.bind(kind, Binding::Push(target.into()))
    }

    /// Declares a pop-transition for `kind`.
    pub fn on_pop(&mut self, kind: EventKind) -> &mut Self {
        self.bind(kind, Binding::Pop)
    }

    /// Defers `kind`: it stays in the inbox while this state is on top.
    pub fn defer(&mut self, kind: EventKind) -> &mut Self {
        self.descriptor.deferred.insert(kind);
        self
    }

    /// Ignores `kind`: it is dropped at dequeue while this state is on top.
    pub fn ignore(&mut self, kind: EventKind) -> &mut Self {
        self.descriptor.ignored.insert(kind);
        self
    }

    fn bind(&mut self, kind: EventKind, binding: Binding<M>) -> &mut Self {
        let previous = self.descriptor.bindings.insert(kind, binding);
        debug_assert!(
            previous.is_none(),
            "state {} already binds event '{kind}'",
            self.descriptor.name
        );
        self
    }
}

/// Per-runtime cache of built declarations, keyed by machine type.
#[derive(Default)]
pub(crate) struct DeclRegistry {
    decls: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DeclRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the cached declaration for `M`, building it on first use.
    pub(crate) fn get_or_build<M: MachineLogic>(&self) -> Result<Arc<MachineDecl<M>>> {
        let mut decls = self.decls.lock();
        if let Some(existing) = decls.get(&TypeId::of::<M>()) {
            let decl = existing
                .clone()
                .downcast::<MachineDecl<M>>()
                .expect("registry entry has the key's type");
            return Ok(decl);
        }
        let decl = Arc::new(MachineDecl::<M>::build()?);
        decls.insert(TypeId::of::<M>(), decl.clone());
        Ok(decl)
    }
}

impl fmt::Debug for DeclRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeclRegistry({} types)", self.decls.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: EventKind = EventKind::new("Tick");
    const DONE: EventKind = EventKind::new("Done");

    #[derive(Default)]
    struct Sample;

    impl MachineLogic for Sample {
        const NAME: &'static str = "Sample";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Init")
                .start()
                .on_goto(TICK, "Working")
                .defer(DONE);
            decl.state("Working").on(DONE, |_m, cx, _ev| cx.halt());
        }
    }

    #[test]
    fn build_valid_declaration() {
        let decl = MachineDecl::<Sample>::build().unwrap();
        assert_eq!(decl.start_state(), StateName::new("Init"));
        assert_eq!(decl.states().count(), 2);

        let init = decl.state(StateName::new("Init")).unwrap();
        assert!(init.handles(TICK));
        assert!(init.defers(DONE));
        assert!(!init.ignores(TICK));
    }

    #[derive(Default)]
    struct NoStart;

    impl MachineLogic for NoStart {
        const NAME: &'static str = "NoStart";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Only").on_pop(TICK);
        }
    }

    #[test]
    fn missing_start_state_is_rejected() {
        let err = MachineDecl::<NoStart>::build().unwrap_err();
        assert!(format!("{err}").contains("no start state"));
    }

    #[derive(Default)]
    struct BadTarget;

    impl MachineLogic for BadTarget {
        const NAME: &'static str = "BadTarget";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Init").start().on_goto(TICK, "Nowhere");
        }
    }

    #[test]
    fn undeclared_goto_target_is_rejected() {
        let err = MachineDecl::<BadTarget>::build().unwrap_err();
        assert!(format!("{err}").contains("Nowhere"));
    }

    #[test]
    fn registry_caches_per_type() {
        let registry = DeclRegistry::new();
        let a = registry.get_or_build::<Sample>().unwrap();
        let b = registry.get_or_build::<Sample>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
