//! faultline controller library.
//!
//! The controller watches `PhysicalMachine` and `ExperimentTask` resources
//! and converges hosts to match: it establishes authenticated sessions with
//! host agents, injects and recovers faults, and folds observed host state
//! back into resource status. The crate ships the `faultline-controller`
//! binary; the library surface exists so integration tests drive the same
//! wiring the binary runs.
//!
//! ## Architecture
//!
//! ```text
//! Controller
//! ├── watch pumps     (store events -> work queue)
//! ├── resync ticker   (periodic full re-enumeration)
//! ├── probe ticker    (session keep-alive, idle eviction)
//! └── worker pool     (reconcile passes, serialized per identity)
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod queue;
pub mod reconcile;
pub mod session;
