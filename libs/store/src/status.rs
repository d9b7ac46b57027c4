//! Error reporting surfaced through object status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad class of a failure recorded in status.
///
/// Matches how the controller treats the failure: config and auth errors
/// wait for the user, transient ones retry, conflict and internal are
/// terminal for the task that hit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Declared state is invalid; retrying cannot help.
    Config,
    /// Network-level failure; retried with backoff.
    TransientNetwork,
    /// Credentials rejected; waits for a credential change.
    Auth,
    /// Another fault already holds the slot on the agent.
    Conflict,
    /// Host unreachable past the backoff ceiling.
    Unreachable,
    /// Unexpected controller-side failure.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Auth => "auth",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure made legible in status, without needing controller logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub class: ErrorKind,
    pub message: String,
}

impl StatusError {
    #[must_use]
    pub fn new(class: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}
