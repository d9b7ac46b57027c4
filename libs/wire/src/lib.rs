//! # faultline-wire
//!
//! Wire contract between the controller and host agents.
//!
//! ## Design Principles
//!
//! - Fault descriptors are self-contained: a fault id plus a kind plus
//!   kind-specific parameters is everything an agent needs
//! - Fault ids derive from the owning task, so apply, verify, and recover
//!   address the same fault slot across re-established sessions
//! - Errors carry their retry class at the point of occurrence; callers
//!   never re-guess whether a failure was transient
//! - Session tokens are opaque and never rendered into logs

mod error;
mod fault;
mod protocol;

pub use error::{error_codes, AgentError, AgentErrorBody};
pub use fault::{FaultId, FaultIdError, FaultKind, FaultSpec, FaultState};
pub use protocol::{
    ApplyFaultRequest, ApplyFaultResponse, AuthenticateRequest, AuthenticateResponse,
    HealthResponse, RecoverFaultResponse, SessionToken, VerifyFaultResponse,
};

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
