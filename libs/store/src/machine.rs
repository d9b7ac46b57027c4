//! The physical machine resource: one remotely managed chaos host.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{Object, ObjectMeta};
use crate::status::StatusError;

/// User-declared half of a machine: where the agent lives and how to
/// authenticate. The controller never writes this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Declared agent address, e.g. `http://10.0.4.12:2333`.
    pub address: String,
    /// Credential presented on session establishment. Absent means the
    /// agent accepts unauthenticated sessions.
    #[serde(default)]
    pub credentials: Option<String>,
}

/// Session health as last observed by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    /// Not probed yet.
    #[default]
    Unknown,
    /// A session is established and the last probe succeeded.
    Connected,
    /// Recent failures, still inside the retry ceiling.
    Unhealthy,
    /// Past the retry ceiling; probed at reduced frequency.
    Unreachable,
    /// Agent rejected the declared credentials; waiting for a spec change.
    AuthFailed,
    /// Declared address failed validation; waiting for a spec change.
    ConfigRejected,
}

impl SessionHealth {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionHealth::Unknown => "unknown",
            SessionHealth::Connected => "connected",
            SessionHealth::Unhealthy => "unhealthy",
            SessionHealth::Unreachable => "unreachable",
            SessionHealth::AuthFailed => "auth_failed",
            SessionHealth::ConfigRejected => "config_rejected",
        }
    }
}

impl fmt::Display for SessionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller-owned half of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub session: SessionHealth,
    /// Last time any call against the agent succeeded.
    #[serde(default)]
    pub last_reachable_at: Option<DateTime<Utc>>,
    /// Most recent failure, cleared on recovery.
    #[serde(default)]
    pub last_error: Option<StatusError>,
}

/// A host running a fault-injection agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalMachine {
    pub meta: ObjectMeta,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl PhysicalMachine {
    #[must_use]
    pub fn new(meta: ObjectMeta, spec: MachineSpec) -> Self {
        Self {
            meta,
            spec,
            status: MachineStatus::default(),
        }
    }
}

impl Object for PhysicalMachine {
    const KIND: &'static str = "PhysicalMachine";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn restore_spec(&mut self, stored: &Self) {
        self.spec = stored.spec.clone();
    }

    fn restore_status(&mut self, stored: &Self) {
        self.status = stored.status.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_unknown_session() {
        let machine = PhysicalMachine::new(
            ObjectMeta::new("chaos", "web-1"),
            MachineSpec {
                address: "http://10.0.4.12:2333".to_string(),
                credentials: None,
            },
        );
        assert_eq!(machine.status.session, SessionHealth::Unknown);
        assert!(machine.status.last_error.is_none());
    }

    #[test]
    fn status_deserializes_when_absent() {
        let json = r#"{
            "meta": { "namespace": "chaos", "name": "web-1" },
            "spec": { "address": "http://10.0.4.12:2333" }
        }"#;
        let machine: PhysicalMachine = serde_json::from_str(json).unwrap();
        assert_eq!(machine.status, MachineStatus::default());
        assert!(machine.spec.credentials.is_none());
    }
}
