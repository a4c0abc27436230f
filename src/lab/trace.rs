//! Schedule traces: record and replay.
//!
//! Every decision the controlled scheduler makes (which operation runs,
//! each boolean/integer choice) is appended to a [`ScheduleTrace`]. A
//! trace plus the same test program replays the exact execution, so every
//! bug report is a reproducible artifact.
//!
//! Traces serialize to JSON with a versioned metadata header; an
//! incompatible version is rejected at load.

use crate::error::{Failure, Result};
use crate::lab::operation::SchedulePointKind;
use crate::types::CompactMachineId;
use serde::{Deserialize, Serialize};

/// Current trace schema version. Bump on breaking changes.
pub const TRACE_SCHEMA_VERSION: u32 = 1;

/// Header describing how a trace was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Schema version.
    pub version: u32,
    /// Strategy seed for the recorded iteration.
    pub seed: u64,
    /// Name of the strategy that produced the trace.
    pub strategy: String,
    /// Optional description (test name, bug id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TraceMetadata {
    /// Creates metadata for a fresh recording.
    #[must_use]
    pub fn new(seed: u64, strategy: impl Into<String>) -> Self {
        Self {
            version: TRACE_SCHEMA_VERSION,
            seed,
            strategy: strategy.into(),
            description: None,
        }
    }

    /// True if this trace can be replayed by the current implementation.
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.version == TRACE_SCHEMA_VERSION
    }
}

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// An operation was chosen to run at a scheduling point.
    Schedule {
        /// The kind of point the yielding operation was at.
        point: SchedulePointKind,
        /// The machine whose operation was chosen.
        chosen: CompactMachineId,
        /// Step index of the decision.
        step: u64,
    },
    /// A nondeterministic boolean choice.
    Boolean {
        /// The chosen value.
        value: bool,
        /// Step index of the decision.
        step: u64,
    },
    /// A nondeterministic integer choice.
    Integer {
        /// The chosen value.
        value: i32,
        /// Step index of the decision.
        step: u64,
    },
}

/// An append-only schedule trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTrace {
    /// Recording metadata.
    pub metadata: TraceMetadata,
    /// Decisions in order.
    pub decisions: Vec<Decision>,
}

impl ScheduleTrace {
    /// Creates an empty trace.
    #[must_use]
    pub fn new(seed: u64, strategy: impl Into<String>) -> Self {
        Self {
            metadata: TraceMetadata::new(seed, strategy),
            decisions: Vec::new(),
        }
    }

    /// Appends a decision.
    pub fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    /// Number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Failure::assertion(format!("trace serialization failed: {e}")))
    }

    /// Loads a trace from JSON, rejecting incompatible versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let trace: Self = serde_json::from_str(json)
            .map_err(|e| Failure::assertion(format!("trace deserialization failed: {e}")))?;
        if !trace.metadata.is_compatible() {
            return Err(Failure::assertion(format!(
                "trace schema version {} is not supported",
                trace.metadata.version
            )));
        }
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> ScheduleTrace {
        let mut trace = ScheduleTrace::new(42, "random");
        trace.push(Decision::Schedule {
            point: SchedulePointKind::Create,
            chosen: CompactMachineId {
                value: 1,
                generation: 1,
            },
            step: 0,
        });
        trace.push(Decision::Boolean {
            value: true,
            step: 1,
        });
        trace.push(Decision::Integer { value: 3, step: 2 });
        trace
    }

    #[test]
    fn json_round_trip() {
        let trace = sample_trace();
        let json = trace.to_json().unwrap();
        let back = ScheduleTrace::from_json(&json).unwrap();
        assert_eq!(trace, back);
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let mut trace = sample_trace();
        trace.metadata.version = 999;
        let json = serde_json::to_string(&trace).unwrap();
        assert!(ScheduleTrace::from_json(&json).is_err());
    }

    #[test]
    fn decisions_preserve_order() {
        let trace = sample_trace();
        assert_eq!(trace.len(), 3);
        assert!(matches!(trace.decisions[0], Decision::Schedule { .. }));
        assert!(matches!(
            trace.decisions[1],
            Decision::Boolean { value: true, .. }
        ));
        assert!(matches!(
            trace.decisions[2],
            Decision::Integer { value: 3, .. }
        ));
    }
}
