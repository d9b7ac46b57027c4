//! Fault descriptors: what gets injected on a host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// The fault families host agents implement.
///
/// Parameters are kind-specific and carried opaquely in [`FaultSpec::params`];
/// the controller validates only that the agent accepted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    NetworkDelay,
    NetworkLoss,
    NetworkPartition,
    StressCpu,
    StressMemory,
    DiskFill,
    ProcessKill,
    ClockSkew,
}

impl FaultKind {
    /// Canonical wire name, also used in status and log rendering.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::NetworkDelay => "network_delay",
            FaultKind::NetworkLoss => "network_loss",
            FaultKind::NetworkPartition => "network_partition",
            FaultKind::StressCpu => "stress_cpu",
            FaultKind::StressMemory => "stress_memory",
            FaultKind::DiskFill => "disk_fill",
            FaultKind::ProcessKill => "process_kill",
            FaultKind::ClockSkew => "clock_skew",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = FaultIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network_delay" => Ok(FaultKind::NetworkDelay),
            "network_loss" => Ok(FaultKind::NetworkLoss),
            "network_partition" => Ok(FaultKind::NetworkPartition),
            "stress_cpu" => Ok(FaultKind::StressCpu),
            "stress_memory" => Ok(FaultKind::StressMemory),
            "disk_fill" => Ok(FaultKind::DiskFill),
            "process_kill" => Ok(FaultKind::ProcessKill),
            "clock_skew" => Ok(FaultKind::ClockSkew),
            other => Err(FaultIdError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors from parsing fault identifiers and kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FaultIdError {
    /// The string is empty.
    #[error("fault id is empty")]
    Empty,

    /// The `flt_` prefix is missing.
    #[error("fault id missing 'flt_' prefix: {0}")]
    MissingPrefix(String),

    /// The ULID portion did not parse.
    #[error("invalid fault id ulid: {0}")]
    InvalidUlid(String),

    /// The fault kind name is not one we know.
    #[error("unknown fault kind: {0}")]
    UnknownKind(String),
}

/// Identifier of one injected fault on one host.
///
/// Format: `flt_{ulid}`. Derived from the owning task's UID rather than
/// freshly generated, so that a controller that lost track of an apply can
/// ask the agent about the exact fault it may have created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaultId(Ulid);

impl FaultId {
    /// The prefix for fault ids.
    pub const PREFIX: &'static str = "flt";

    /// Derives the fault id owned by a task UID.
    ///
    /// Deterministic: the same task always maps to the same fault id.
    #[must_use]
    pub const fn for_task(task_uid: Ulid) -> Self {
        Self(task_uid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Parses a fault id from its `flt_{ulid}` form.
    pub fn parse(s: &str) -> Result<Self, FaultIdError> {
        if s.is_empty() {
            return Err(FaultIdError::Empty);
        }

        let Some(ulid_str) = s.strip_prefix("flt_") else {
            return Err(FaultIdError::MissingPrefix(s.to_string()));
        };

        let ulid = ulid_str
            .parse::<Ulid>()
            .map_err(|e| FaultIdError::InvalidUlid(e.to_string()))?;

        Ok(Self(ulid))
    }
}

impl fmt::Display for FaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for FaultId {
    type Err = FaultIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FaultId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FaultId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A complete fault description an agent can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    /// Identifier the fault is addressed by in verify and recover calls.
    pub id: FaultId,
    /// Which fault family to inject.
    pub kind: FaultKind,
    /// Kind-specific parameters, passed through to the agent unmodified.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl FaultSpec {
    #[must_use]
    pub fn new(id: FaultId, kind: FaultKind, params: serde_json::Value) -> Self {
        Self { id, kind, params }
    }
}

/// Whether a fault is present on the host, as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    /// The agent has no record of the fault.
    Absent,
    /// The fault is injected and running.
    Active,
}

impl FaultState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, FaultState::Active)
    }
}

impl fmt::Display for FaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultState::Absent => f.write_str("absent"),
            FaultState::Active => f.write_str("active"),
        }
    }
}
