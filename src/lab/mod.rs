//! The controlled testing backend.
//!
//! Serializes every externally observable step of a machine program
//! (create, send, dequeue/receive, nondeterministic choice, stop) through
//! a strategy-driven scheduler, so interleavings can be explored
//! systematically, liveness bugs detected, and any schedule replayed from
//! its trace.
//!
//! - [`engine`]: iteration driver ([`TestEngine`], [`TestReport`])
//! - [`scheduler`]: the serializing scheduler and iteration outcomes
//! - [`strategy`]: pluggable exploration policies
//! - [`trace`]: record/replay schedule traces
//! - [`fingerprint`]: program-state hashing and cycle detection
//! - [`operation`]: schedulable operations and their gates

pub mod engine;
pub mod fingerprint;
pub mod operation;
pub(crate) mod runtime;
pub mod scheduler;
pub mod strategy;
pub mod trace;

pub use engine::{BugReport, TestEngine, TestReport};
pub use fingerprint::{Fingerprint, FingerprintCache};
pub use operation::{OpId, SchedulableOp, SchedulePointKind, TargetKind};
pub use scheduler::IterationOutcome;
pub use strategy::SchedulingStrategy;
pub use trace::{Decision, ScheduleTrace, TraceMetadata};
