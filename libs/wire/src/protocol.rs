//! Request and response bodies for the agent protocol.

use serde::{Deserialize, Serialize};

use crate::fault::{FaultId, FaultSpec, FaultState};

/// Opaque bearer token returned by a successful authenticate call.
///
/// The token value never appears in `Debug` output; logs identify sessions
/// by machine, not by credential material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value, for the transport layer only.
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// `POST /api/session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub credentials: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub token: SessionToken,
    /// Agent build version, recorded for debugging skew between hosts.
    #[serde(default)]
    pub agent_version: Option<String>,
}

/// `POST /api/faults`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyFaultRequest {
    pub fault: FaultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyFaultResponse {
    pub id: FaultId,
    pub state: FaultState,
}

/// `GET /api/faults/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyFaultResponse {
    pub id: FaultId,
    pub state: FaultState,
}

/// `DELETE /api/faults/{id}`
///
/// Recover is idempotent: deleting an absent fault reports `Absent` with a
/// success status rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverFaultResponse {
    pub id: FaultId,
    pub state: FaultState,
}

/// `GET /api/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    /// Number of faults the agent currently holds active.
    #[serde(default)]
    pub active_faults: u32,
}
