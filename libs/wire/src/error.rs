//! Agent call failures, classified where they occur.

use faultline_backoff::ErrorClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::FaultKind;

/// Machine-readable error codes agents put in structured error bodies.
pub mod error_codes {
    pub const AUTH_REJECTED: &str = "auth_rejected";
    pub const CONFLICT: &str = "conflict";
    pub const UNSUPPORTED_FAULT: &str = "unsupported_fault";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INTERNAL: &str = "internal";
}

/// Structured error body returned by agents alongside a non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl AgentErrorBody {
    /// Maps a decoded error body plus its HTTP status to a typed error.
    ///
    /// Unknown codes fall back to status-based classification via
    /// [`AgentError::Remote`].
    #[must_use]
    pub fn into_error(self, status: u16) -> AgentError {
        match self.code.as_str() {
            error_codes::AUTH_REJECTED => AgentError::AuthRejected,
            error_codes::CONFLICT => AgentError::Conflict {
                active_kind: self.message.parse::<FaultKind>().ok(),
            },
            error_codes::UNSUPPORTED_FAULT => AgentError::UnsupportedFault(self.message),
            error_codes::INVALID_REQUEST => AgentError::InvalidRequest(self.message),
            _ => AgentError::Remote {
                status,
                message: self.message,
            },
        }
    }
}

/// Failure of one call against a host agent.
///
/// Every variant knows its own retry class; the session manager and
/// dispatcher branch on [`AgentError::class`] instead of matching variants.
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// TCP connect failed: host down, port closed, or route missing.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The call did not complete within its deadline.
    #[error("agent call timed out after {0}ms")]
    Timeout(u64),

    /// The transport dropped mid-call; the outcome on the agent is unknown.
    #[error("transport reset: {0}")]
    TransportReset(String),

    /// The agent rejected our credentials.
    #[error("agent rejected credentials")]
    AuthRejected,

    /// The agent already holds a different fault in this slot.
    #[error("fault slot already occupied{}", conflict_suffix(.active_kind))]
    Conflict { active_kind: Option<FaultKind> },

    /// The agent does not implement the requested fault kind.
    #[error("agent does not support fault: {0}")]
    UnsupportedFault(String),

    /// The agent could not parse or validate the request.
    #[error("agent rejected request: {0}")]
    InvalidRequest(String),

    /// Agent-side failure without a structured code.
    #[error("agent returned status {status}: {message}")]
    Remote { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("undecodable agent response: {0}")]
    Protocol(String),
}

fn conflict_suffix(active_kind: &Option<FaultKind>) -> String {
    match active_kind {
        Some(kind) => format!(" by {kind}"),
        None => String::new(),
    }
}

impl AgentError {
    /// Retry class, decided at the point the error was produced.
    ///
    /// Connection-level failures and agent-side 5xx responses are worth
    /// retrying; everything the agent deliberately rejected is not.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Connect(_) | AgentError::Timeout(_) | AgentError::TransportReset(_) => {
                ErrorClass::Transient
            }
            AgentError::Remote { status, .. } if *status >= 500 => ErrorClass::Transient,
            AgentError::AuthRejected
            | AgentError::Conflict { .. }
            | AgentError::UnsupportedFault(_)
            | AgentError::InvalidRequest(_)
            | AgentError::Remote { .. }
            | AgentError::Protocol(_) => ErrorClass::Permanent,
        }
    }

    /// True when the call may have reached the agent but we never saw the
    /// result. Apply is not safely repeatable after these: the dispatcher
    /// must verify before it retries.
    #[must_use]
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, AgentError::Timeout(_) | AgentError::TransportReset(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(AgentError::Connect("refused".into()), ErrorClass::Transient)]
    #[case(AgentError::Timeout(3000), ErrorClass::Transient)]
    #[case(AgentError::TransportReset("broken pipe".into()), ErrorClass::Transient)]
    #[case(AgentError::Remote { status: 503, message: "busy".into() }, ErrorClass::Transient)]
    #[case(AgentError::AuthRejected, ErrorClass::Permanent)]
    #[case(AgentError::Conflict { active_kind: None }, ErrorClass::Permanent)]
    #[case(AgentError::UnsupportedFault("clock_skew".into()), ErrorClass::Permanent)]
    #[case(AgentError::InvalidRequest("latency_ms must be > 0".into()), ErrorClass::Permanent)]
    #[case(AgentError::Remote { status: 404, message: "no such route".into() }, ErrorClass::Permanent)]
    #[case(AgentError::Protocol("body was not json".into()), ErrorClass::Permanent)]
    fn classification_is_fixed_per_variant(#[case] err: AgentError, #[case] class: ErrorClass) {
        assert_eq!(err.class(), class);
    }

    #[test]
    fn connect_failures_have_known_outcome() {
        assert!(!AgentError::Connect("refused".into()).outcome_unknown());
        assert!(AgentError::Timeout(500).outcome_unknown());
        assert!(AgentError::TransportReset("reset by peer".into()).outcome_unknown());
    }

    #[test]
    fn error_body_maps_known_codes() {
        let body = AgentErrorBody {
            code: error_codes::CONFLICT.to_string(),
            message: "network_delay".to_string(),
        };
        match body.into_error(409) {
            AgentError::Conflict { active_kind } => {
                assert_eq!(active_kind, Some(FaultKind::NetworkDelay));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        let body = AgentErrorBody {
            code: error_codes::AUTH_REJECTED.to_string(),
            message: String::new(),
        };
        assert!(matches!(body.into_error(401), AgentError::AuthRejected));
    }

    #[test]
    fn error_body_unknown_code_falls_back_to_status() {
        let body = AgentErrorBody {
            code: "quota_exceeded".to_string(),
            message: "too many faults".to_string(),
        };
        let err = body.into_error(500);
        assert!(matches!(err, AgentError::Remote { status: 500, .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn conflict_message_names_the_occupant() {
        let err = AgentError::Conflict {
            active_kind: Some(FaultKind::StressCpu),
        };
        assert_eq!(err.to_string(), "fault slot already occupied by stress_cpu");

        let bare = AgentError::Conflict { active_kind: None };
        assert_eq!(bare.to_string(), "fault slot already occupied");
    }
}
