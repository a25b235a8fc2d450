//! Task module - tasks, capabilities and request decomposition.
//!
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are enforced in constructors and transition methods
//! - Decomposition is pure; no IO happens here

mod capability;
mod decompose;
pub mod task;

pub use capability::{format_capabilities, Capability, CapabilitySet, UnknownCapability};
pub use decompose::{DecomposeError, Decomposer};
pub use task::{FailureReason, Task, TaskError, TaskId, TaskStatus};
