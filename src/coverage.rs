//! Activity coverage.
//!
//! When enabled, the runtimes count visited states and fired transitions
//! per machine type. The report is deterministic (BTreeMap-ordered) and is
//! merged across iterations by the test engine.

use crate::event::EventKind;
use crate::types::StateName;
use std::collections::BTreeMap;
use std::fmt;

/// A (from, event, to) transition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransitionKey {
    /// Source state.
    pub from: StateName,
    /// Triggering event kind.
    pub kind: EventKind,
    /// Target state.
    pub to: StateName,
}

/// Per-machine-type activity counts.
#[derive(Debug, Clone, Default)]
pub struct ActivityCoverage {
    /// Visit count per state.
    pub states: BTreeMap<StateName, u64>,
    /// Fire count per transition.
    pub transitions: BTreeMap<TransitionKey, u64>,
}

/// Coverage across all machine types.
#[derive(Debug, Clone, Default)]
pub struct CoverageReport {
    per_type: BTreeMap<&'static str, ActivityCoverage>,
}

impl CoverageReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a state entry.
    pub fn record_state(&mut self, machine_type: &'static str, state: StateName) {
        *self
            .per_type
            .entry(machine_type)
            .or_default()
            .states
            .entry(state)
            .or_insert(0) += 1;
    }

    /// Records a fired transition.
    pub fn record_transition(
        &mut self,
        machine_type: &'static str,
        from: StateName,
        kind: EventKind,
        to: StateName,
    ) {
        *self
            .per_type
            .entry(machine_type)
            .or_default()
            .transitions
            .entry(TransitionKey { from, kind, to })
            .or_insert(0) += 1;
    }

    /// Merges another report into this one.
    pub fn merge(&mut self, other: &Self) {
        for (machine_type, activity) in &other.per_type {
            let entry = self.per_type.entry(machine_type).or_default();
            for (state, count) in &activity.states {
                *entry.states.entry(*state).or_insert(0) += count;
            }
            for (key, count) in &activity.transitions {
                *entry.transitions.entry(*key).or_insert(0) += count;
            }
        }
    }

    /// Activity for one machine type, if any was recorded.
    #[must_use]
    pub fn for_type(&self, machine_type: &str) -> Option<&ActivityCoverage> {
        self.per_type.get(machine_type)
    }

    /// Iterates per-type activity in type-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ActivityCoverage)> {
        self.per_type.iter().map(|(name, activity)| (*name, activity))
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_type.is_empty()
    }
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.per_type.is_empty() {
            return writeln!(f, "no activity recorded");
        }
        for (machine_type, activity) in &self.per_type {
            writeln!(f, "{machine_type}:")?;
            for (state, count) in &activity.states {
                writeln!(f, "  state {state}: {count}")?;
            }
            for (key, count) in &activity.transitions {
                writeln!(
                    f,
                    "  {} --{}--> {}: {count}",
                    key.from, key.kind, key.to
                )?;
            }
        }
        Ok(())
    }
}
