//! Machine identity.
//!
//! A [`MachineId`] names a machine for the lifetime of a runtime: a
//! monotonic value plus the runtime generation, with the machine type and
//! optional friendly/endpoint labels for diagnostics. The `(value,
//! generation)` pair is globally unique and is never rebound after the
//! owning machine halts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The name of a declared machine state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateName(&'static str);

impl StateName {
    /// Creates a state name from a static string.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateName({})", self.0)
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl From<&'static str> for StateName {
    fn from(name: &'static str) -> Self {
        Self(name)
    }
}

/// What flavor of machine a cell hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    /// An application machine.
    Regular,
    /// The test-entry pseudo machine driving a controlled schedule.
    TestHarness,
    /// A timer stand-in that elapses nondeterministically under testing.
    TimerStub,
}

/// A stable, equality-comparable machine identifier.
///
/// Equality, ordering, and hashing consider only `(value, generation)`;
/// the type name and labels are diagnostics.
#[derive(Clone)]
pub struct MachineId {
    value: u64,
    generation: u64,
    machine_type: &'static str,
    friendly_name: Option<Arc<str>>,
    endpoint: Option<Arc<str>>,
}

impl MachineId {
    pub(crate) fn new(
        value: u64,
        generation: u64,
        machine_type: &'static str,
        friendly_name: Option<&str>,
        endpoint: Option<&str>,
    ) -> Self {
        Self {
            value,
            generation,
            machine_type,
            friendly_name: friendly_name.map(Arc::from),
            endpoint: endpoint.map(Arc::from),
        }
    }

    /// Returns the monotonic value component.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Returns the runtime generation component.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the machine type name.
    #[must_use]
    pub const fn machine_type(&self) -> &'static str {
        self.machine_type
    }

    /// Returns the friendly name, if one was given.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    /// Returns the endpoint label, if one was given.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Creates an id for unit tests.
    #[doc(hidden)]
    #[must_use]
    pub fn new_for_test(value: u64, machine_type: &'static str) -> Self {
        Self::new(value, 0, machine_type, None, None)
    }
}

impl PartialEq for MachineId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.generation == other.generation
    }
}

impl Eq for MachineId {}

impl PartialOrd for MachineId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MachineId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.generation, self.value).cmp(&(other.generation, other.value))
    }
}

impl std::hash::Hash for MachineId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.value);
        state.write_u64(self.generation);
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachineId({}:{} {})",
            self.value, self.generation, self.machine_type
        )
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.friendly_name {
            Some(name) => write!(f, "{name}({})", self.value),
            None => write!(f, "{}({})", self.machine_type, self.value),
        }
    }
}

/// Packed `(value, generation)` pair for schedule trace serialization.
///
/// Traces must round-trip through files; the compact form drops the
/// diagnostic labels and keeps only what identity comparison uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactMachineId {
    /// Monotonic value component.
    pub value: u64,
    /// Runtime generation component.
    pub generation: u64,
}

impl From<&MachineId> for CompactMachineId {
    fn from(id: &MachineId) -> Self {
        Self {
            value: id.value,
            generation: id.generation,
        }
    }
}

/// Allocator for machine id values within one runtime.
///
/// Values are monotonic; the generation is fixed per runtime instance so
/// ids from different runtime incarnations never compare equal.
#[derive(Debug)]
pub struct MachineIdSource {
    next_value: AtomicU64,
    generation: u64,
}

impl MachineIdSource {
    /// Creates a source for the given runtime generation.
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self {
            next_value: AtomicU64::new(1),
            generation,
        }
    }

    /// Allocates a fresh id.
    pub fn next(
        &self,
        machine_type: &'static str,
        friendly_name: Option<&str>,
        endpoint: Option<&str>,
    ) -> MachineId {
        let value = self.next_value.fetch_add(1, Ordering::Relaxed);
        MachineId::new(value, self.generation, machine_type, friendly_name, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_labels() {
        let a = MachineId::new(1, 0, "Server", Some("s"), None);
        let b = MachineId::new(1, 0, "Server", None, Some("node0"));
        assert_eq!(a, b);

        let c = MachineId::new(1, 1, "Server", None, None);
        assert_ne!(a, c);
    }

    #[test]
    fn source_is_monotonic() {
        let source = MachineIdSource::new(3);
        let a = source.next("A", None, None);
        let b = source.next("A", None, None);
        assert!(a.value() < b.value());
        assert_eq!(a.generation(), 3);
    }

    #[test]
    fn display_prefers_friendly_name() {
        let plain = MachineId::new(5, 0, "Server", None, None);
        assert_eq!(format!("{plain}"), "Server(5)");

        let named = MachineId::new(5, 0, "Server", Some("primary"), None);
        assert_eq!(format!("{named}"), "primary(5)");
    }

    #[test]
    fn compact_round_trip() {
        let id = MachineId::new(9, 2, "Client", None, None);
        let compact = CompactMachineId::from(&id);
        let json = serde_json::to_string(&compact).unwrap();
        let back: CompactMachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(compact, back);
        assert_eq!(back.value, 9);
        assert_eq!(back.generation, 2);
    }
}
