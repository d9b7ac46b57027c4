//! # faultline-store
//!
//! Resource model and the versioned object store the controller runs against.
//!
//! ## Design Principles
//!
//! - Spec is user-owned, status is controller-owned; the store enforces the
//!   split mechanically instead of trusting callers
//! - Every write is a compare-and-swap on `resource_version`; lost updates
//!   surface as `Conflict`, never as silent overwrites
//! - Deletion is two-phase: objects with finalizers get a
//!   `deletion_timestamp` and stay visible until the finalizers clear
//! - Watchers see every committed write; consumers that need a complete view
//!   start from `list` and treat events as wake-ups, not as a journal

mod collection;
mod machine;
mod meta;
mod status;
mod task;

pub use collection::{modify, modify_status, Collection, ResourceEvent, StoreError};
pub use machine::{MachineSpec, MachineStatus, PhysicalMachine, SessionHealth};
pub use meta::{Object, ObjectKey, ObjectMeta};
pub use status::{ErrorKind, StatusError};
pub use task::{ExperimentTask, FaultDescriptor, TaskPhase, TaskSpec, TaskStatus};
