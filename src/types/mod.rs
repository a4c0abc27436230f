//! Core identity types.

pub mod id;

pub use id::{CompactMachineId, MachineId, MachineIdSource, MachineKind, StateName};
