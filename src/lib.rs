//! Machina: a runtime for asynchronous communicating state machines.
//!
//! # Overview
//!
//! Machina executes concurrent entities ("machines") that own a private
//! inbox, dequeue events one at a time, and run handlers declared per
//! (state, event) pair. Handlers may transition the state stack
//! (goto/push/pop/raise), create machines, send events, or block in a
//! selective `receive`. Two backends share one surface:
//!
//! - the **production runtime** executes handler runs in parallel on host
//!   threads, serialized per machine by the inbox discipline;
//! - the **controlled testing runtime** serializes every observable step
//!   through a strategy-driven scheduler to systematically explore
//!   interleavings, detect safety and liveness bugs, and replay any
//!   schedule from its recorded trace.
//!
//! # Core Guarantees
//!
//! - **One handler per machine**: at most one handler run is active per
//!   machine at any instant, in both backends.
//! - **FIFO per pair**: events from one sender to one receiver are
//!   dequeued in send order, subject only to deferred/ignored filtering.
//! - **Must-handle**: an event flagged must-handle can neither be dropped
//!   nor left enqueued past its target's halt.
//! - **Reproducibility**: under the controlled backend, a seed (or a
//!   recorded trace) fully determines the execution.
//!
//! # Module Structure
//!
//! - [`event`]: event values, kinds, operation groups, send options
//! - [`types`]: machine identity
//! - [`machine`]: declarations, inbox, machine core, action context
//! - [`monitor`]: synchronous specification monitors with hot/cold states
//! - [`runtime`]: the façade and the production backend
//! - [`lab`]: the controlled testing backend (scheduler, strategies,
//!   traces, fingerprints, test engine)
//! - [`timer`]: timers as machines (wall-clock and controlled stub)
//! - [`coverage`]: activity coverage reports
//! - [`config`]: runtime and test configuration
//! - [`error`]: the failure taxonomy
//! - [`util`]: deterministic RNG, hashing, and arena utilities

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod coverage;
pub mod error;
pub mod event;
pub mod lab;
pub mod machine;
pub mod monitor;
pub mod runtime;
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;
pub mod timer;
pub mod tracing_compat;
pub mod types;
pub mod util;

pub use config::{RuntimeConfig, StrategyKind, TestConfig};
pub use coverage::CoverageReport;
pub use error::{Failure, Result, TransitionMisuse};
pub use event::{Event, EventKind, OperationGroupId, SendOptions};
pub use lab::{BugReport, ScheduleTrace, TestEngine, TestReport};
pub use machine::{ActionCx, DeclBuilder, MachineLogic, Temperature};
pub use runtime::Runtime;
pub use types::{MachineId, StateName};
