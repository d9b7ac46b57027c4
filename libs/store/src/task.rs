//! The experiment task resource: one fault on one machine for a duration.

use std::fmt;

use chrono::{DateTime, Utc};
use faultline_wire::{FaultId, FaultKind, FaultSpec};
use serde::{Deserialize, Serialize};

use crate::meta::{Object, ObjectMeta};
use crate::status::StatusError;

/// User-declared fault to inject: which family, with which parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDescriptor {
    pub kind: FaultKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// User-declared half of a task. The controller never writes this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name of the target machine, same namespace as the task.
    pub machine: String,
    pub fault: FaultDescriptor,
    /// How long the fault stays injected. Absent means until the task is
    /// deleted.
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// Where a task is in its lifecycle.
///
/// Order of states: `Pending` → `Applying` → `Applied` → `Expired` →
/// `Recovering` → `Recovered`, with `Failed` reachable from any non-terminal
/// state. `Recovered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Pending,
    Applying,
    Applied,
    Expired,
    Recovering,
    Recovered,
    Failed,
}

impl TaskPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Pending => "pending",
            TaskPhase::Applying => "applying",
            TaskPhase::Applied => "applied",
            TaskPhase::Expired => "expired",
            TaskPhase::Recovering => "recovering",
            TaskPhase::Recovered => "recovered",
            TaskPhase::Failed => "failed",
        }
    }

    /// Terminal phases never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Recovered | TaskPhase::Failed)
    }

    /// Phases in which the fault may be present on the host.
    #[must_use]
    pub fn fault_may_be_active(&self) -> bool {
        matches!(
            self,
            TaskPhase::Applying | TaskPhase::Applied | TaskPhase::Expired | TaskPhase::Recovering
        )
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller-owned half of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub phase: TaskPhase,
    /// When the fault was confirmed injected.
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    /// When the duration ran out.
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
    /// When recovery was confirmed.
    #[serde(default)]
    pub recovered_at: Option<DateTime<Utc>>,
    /// Most recent failure, cleared on forward progress.
    #[serde(default)]
    pub last_error: Option<StatusError>,
    /// Set when the machine stayed unreachable past the orphan grace period
    /// and the task was released without confirmed recovery.
    #[serde(default)]
    pub orphaned: bool,
}

/// One fault injection experiment against one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTask {
    pub meta: ObjectMeta,
    pub spec: TaskSpec,
    #[serde(default)]
    pub status: TaskStatus,
}

impl ExperimentTask {
    #[must_use]
    pub fn new(meta: ObjectMeta, spec: TaskSpec) -> Self {
        Self {
            meta,
            spec,
            status: TaskStatus::default(),
        }
    }

    /// The fault id this task owns on its machine's agent.
    ///
    /// Derived from the task UID, so it survives controller restarts and
    /// session re-establishment. `None` before the store assigned a UID.
    #[must_use]
    pub fn fault_id(&self) -> Option<FaultId> {
        self.meta.uid.map(FaultId::for_task)
    }

    /// The wire-level fault spec sent to the agent.
    #[must_use]
    pub fn fault_spec(&self) -> Option<FaultSpec> {
        self.fault_id()
            .map(|id| FaultSpec::new(id, self.spec.fault.kind, self.spec.fault.params.clone()))
    }
}

impl Object for ExperimentTask {
    const KIND: &'static str = "ExperimentTask";

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
    use rstest::rstest;
    use ulid::Ulid;

    fn task() -> ExperimentTask {
        ExperimentTask::new(
            ObjectMeta::new("chaos", "delay-web-1"),
            TaskSpec {
                machine: "web-1".to_string(),
                fault: FaultDescriptor {
                    kind: FaultKind::NetworkDelay,
                    params: serde_json::json!({ "latency_ms": 100 }),
                },
                duration_secs: Some(30),
            },
        )
    }

    #[rstest]
    #[case(TaskPhase::Pending, false)]
    #[case(TaskPhase::Applying, false)]
    #[case(TaskPhase::Applied, false)]
    #[case(TaskPhase::Expired, false)]
    #[case(TaskPhase::Recovering, false)]
    #[case(TaskPhase::Recovered, true)]
    #[case(TaskPhase::Failed, true)]
    fn terminal_phases(#[case] phase: TaskPhase, #[case] terminal: bool) {
        assert_eq!(phase.is_terminal(), terminal);
    }

    #[test]
    fn fault_id_requires_assigned_uid() {
        let mut t = task();
        assert!(t.fault_id().is_none());

        t.meta.uid = Some(Ulid::new());
        let id = t.fault_id().unwrap();
        assert_eq!(t.fault_id().unwrap(), id);
    }

    #[test]
    fn fault_spec_carries_declared_params() {
        let mut t = task();
        t.meta.uid = Some(Ulid::new());

        let spec = t.fault_spec().unwrap();
        assert_eq!(spec.kind, FaultKind::NetworkDelay);
        assert_eq!(spec.params["latency_ms"], 100);
        assert_eq!(spec.id, t.fault_id().unwrap());
    }

    #[test]
    fn phase_display_is_snake_case() {
        assert_eq!(TaskPhase::Recovering.to_string(), "recovering");
        let json = serde_json::to_string(&TaskPhase::Applied).unwrap();
        assert_eq!(json, "\"applied\"");
    }
}
