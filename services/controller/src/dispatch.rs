//! Experiment dispatcher: drives one task one state-machine step at a time.
//!
//! Every step persists the phase and last-action result before returning,
//! so a crash resumes from the last persisted phase. Remote actions against
//! one machine run under that machine's action lock; apply completes or
//! fails classified before the next action on the same machine starts.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use faultline_address::{resolve, Scheme};
use faultline_backoff::{BackoffPolicy, RetryTracker};
use faultline_store::{
    modify, modify_status, Collection, ErrorKind, ExperimentTask, Object, ObjectKey,
    PhysicalMachine, SessionHealth, StatusError, StoreError, TaskPhase, TaskStatus,
};
use faultline_wire::{AgentError, FaultId, FaultSpec, FaultState};
use tracing::{info, warn};

use crate::client::AgentApi;
use crate::config::ControllerConfig;
use crate::queue::KeyedLocks;
use crate::session::{Session, SessionError, SessionManager};

/// Finalizer gating task deletion on fault recovery.
pub const TASK_FINALIZER: &str = "faultline.sh/recover";

/// What the reconciler should do after a dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Re-invoke after the delay.
    Requeue(Duration),
    /// Converged for now; change events or resync drive the next step.
    Settled,
    /// The task is in a terminal phase (or gone).
    Terminal,
}

pub struct Dispatcher {
    tasks: Collection<ExperimentTask>,
    sessions: Arc<SessionManager>,
    agent: Arc<dyn AgentApi>,
    /// Serializes remote actions per machine across tasks.
    action_locks: KeyedLocks<ObjectKey>,
    retries: StdMutex<RetryTracker>,
    policy: BackoffPolicy,
    action_timeout: Duration,
    allowed_schemes: Vec<Scheme>,
    orphan_grace: Duration,
}

impl Dispatcher {
    pub fn new(
        tasks: Collection<ExperimentTask>,
        sessions: Arc<SessionManager>,
        agent: Arc<dyn AgentApi>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            tasks,
            sessions,
            agent,
            action_locks: KeyedLocks::new(),
            retries: StdMutex::new(RetryTracker::new(Duration::from_secs(600))),
            policy: config.backoff.clone(),
            action_timeout: config.action_timeout,
            allowed_schemes: config.allowed_schemes.clone(),
            orphan_grace: config.orphan_grace,
        }
    }

    /// Executes at most one state-machine step for the task.
    pub async fn advance(
        &self,
        task: &ExperimentTask,
        machine: &PhysicalMachine,
    ) -> Result<Progress, StoreError> {
        match task.status.phase {
            TaskPhase::Pending => self.step_pending(task, machine).await,
            TaskPhase::Applying => self.step_applying(task, machine).await,
            TaskPhase::Applied => self.step_applied(task).await,
            TaskPhase::Expired => {
                self.persist_status(&task.key(), |status| {
                    status.phase = TaskPhase::Recovering;
                })
                .await?;
                Ok(Progress::Settled)
            }
            TaskPhase::Recovering => self.step_recovering(task, machine).await,
            TaskPhase::Recovered | TaskPhase::Failed => {
                self.forget_retries(&task.key());
                Ok(Progress::Terminal)
            }
        }
    }

    async fn step_pending(
        &self,
        task: &ExperimentTask,
        machine: &PhysicalMachine,
    ) -> Result<Progress, StoreError> {
        let key = task.key();

        if machine.meta.is_deleting() {
            return self.fail(&key, ErrorKind::Config, "machine is being deleted").await;
        }

        // Fault-slot precheck: an older live task holding the same
        // machine+kind slot defers this one rather than failing it. Only
        // an agent-reported conflict is terminal.
        if self.older_slot_holder_exists(task).await {
            return Ok(Progress::Requeue(self.policy.jittered_delay_for(1)));
        }

        self.persist_status(&key, |status| {
            status.phase = TaskPhase::Applying;
            status.last_error = None;
        })
        .await?;
        info!(task = %key, machine = %machine.key(), "Task admitted, applying");
        Ok(Progress::Settled)
    }

    async fn older_slot_holder_exists(&self, task: &ExperimentTask) -> bool {
        let Some(my_uid) = task.meta.uid else {
            return false;
        };
        self.tasks.list().await.into_iter().any(|other| {
            other.key() != task.key()
                && other.meta.namespace == task.meta.namespace
                && other.spec.machine == task.spec.machine
                && other.spec.fault.kind == task.spec.fault.kind
                && !other.status.phase.is_terminal()
                && other.meta.uid.is_some_and(|uid| uid < my_uid)
        })
    }

    async fn step_applying(
        &self,
        task: &ExperimentTask,
        machine: &PhysicalMachine,
    ) -> Result<Progress, StoreError> {
        let key = task.key();
        let Some(fault) = task.fault_spec() else {
            return self.fail(&key, ErrorKind::Internal, "task has no uid").await;
        };

        let session = match self.connect(machine).await {
            Ok(session) => session,
            Err(err) => return self.session_setback(&key, err).await,
        };

        let machine_slot = self.action_locks.lock(machine.key()).await;
        let outcome = self
            .ensure_fault_applied(&session, &fault, machine.meta.is_deleting())
            .await;
        drop(machine_slot);
        self.sessions.release(&session).await;

        match outcome {
            Ok(EnsureApplied::Active) => self.confirm_applied(&key, machine).await,
            Ok(EnsureApplied::RefusedDeleting) => {
                self.fail(&key, ErrorKind::Config, "machine is being deleted").await
            }
            Ok(EnsureApplied::NotPresent) => {
                // Acknowledged but not present: treat like a transient miss.
                let delay = self.next_delay(&key);
                self.persist_status(&key, |status| {
                    status.last_error = Some(StatusError::new(
                        ErrorKind::TransientNetwork,
                        "apply acknowledged but fault not present",
                    ));
                })
                .await?;
                Ok(Progress::Requeue(delay))
            }
            Err(err) => self.action_setback(&key, machine, err, true).await,
        }
    }

    /// Verify before apply. The previous apply's outcome may be unknown;
    /// only a confirmed absent fault is applied, never a possibly-present
    /// one.
    async fn ensure_fault_applied(
        &self,
        session: &Session,
        fault: &FaultSpec,
        machine_deleting: bool,
    ) -> Result<EnsureApplied, AgentError> {
        if self.call_verify(session, fault.id).await?.is_active() {
            return Ok(EnsureApplied::Active);
        }
        if machine_deleting {
            return Ok(EnsureApplied::RefusedDeleting);
        }
        match self.call_apply(session, fault).await? {
            FaultState::Active => Ok(EnsureApplied::Active),
            FaultState::Absent => Ok(EnsureApplied::NotPresent),
        }
    }

    async fn confirm_applied(
        &self,
        key: &ObjectKey,
        machine: &PhysicalMachine,
    ) -> Result<Progress, StoreError> {
        self.forget_retries(key);
        self.persist_status(key, |status| {
            status.phase = TaskPhase::Applied;
            status.applied_at = Some(Utc::now());
            status.last_error = None;
        })
        .await?;
        info!(task = %key, machine = %machine.key(), "Fault applied");
        Ok(Progress::Settled)
    }

    async fn step_applied(
        &self,
        task: &ExperimentTask,
    ) -> Result<Progress, StoreError> {
        let key = task.key();
        let Some(duration_secs) = task.spec.duration_secs else {
            return Ok(Progress::Settled);
        };
        let Some(applied_at) = task.status.applied_at else {
            return Ok(Progress::Settled);
        };

        let expires_at = applied_at + chrono::Duration::seconds(duration_secs as i64);
        let now = Utc::now();
        if now < expires_at {
            let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
            return Ok(Progress::Requeue(remaining));
        }

        self.persist_status(&key, |status| {
            status.phase = TaskPhase::Expired;
            status.expired_at = Some(Utc::now());
        })
        .await?;
        info!(task = %key, duration_secs, "Fault duration elapsed");
        Ok(Progress::Settled)
    }

    async fn step_recovering(
        &self,
        task: &ExperimentTask,
        machine: &PhysicalMachine,
    ) -> Result<Progress, StoreError> {
        let key = task.key();
        let Some(fault_id) = task.fault_id() else {
            return self.fail(&key, ErrorKind::Internal, "task has no uid").await;
        };

        let session = match self.connect(machine).await {
            Ok(session) => session,
            Err(err) => return self.session_setback(&key, err).await,
        };

        let machine_slot = self.action_locks.lock(machine.key()).await;
        let recovered = self.call_recover(&session, fault_id).await;
        drop(machine_slot);
        self.sessions.release(&session).await;

        match recovered {
            Ok(_) => {
                self.forget_retries(&key);
                self.persist_status(&key, |status| {
                    status.phase = TaskPhase::Recovered;
                    status.recovered_at = Some(Utc::now());
                    status.last_error = None;
                })
                .await?;
                info!(task = %key, machine = %machine.key(), "Fault recovered");
                Ok(Progress::Terminal)
            }
            // Recovery is never abandoned: permanent errors here still
            // requeue, at the backoff ceiling's cadence.
            Err(err) => self.action_setback(&key, machine, err, false).await,
        }
    }

    /// Deletion path. Cancels what never applied, forces recovery of what
    /// did, and orphans what cannot be recovered from an unreachable host.
    pub async fn finalize(
        &self,
        task: &ExperimentTask,
        machine: Option<&PhysicalMachine>,
    ) -> Result<Progress, StoreError> {
        let key = task.key();

        if !task.meta.has_finalizer(TASK_FINALIZER) {
            return Ok(Progress::Terminal);
        }

        if task.status.phase.is_terminal() || task.status.phase == TaskPhase::Pending {
            return self.release_finalizer(&key).await;
        }

        let Some(machine) = machine else {
            // Machine resource is gone; nothing left to recover against.
            self.orphan(&key, "machine no longer exists").await?;
            return self.release_finalizer(&key).await;
        };

        let session = match self.connect(machine).await {
            Ok(session) => session,
            Err(TaskSetback::Config(message)) => {
                // The address no longer resolves; no amount of retrying
                // reaches the host.
                self.orphan(&key, &format!("machine address invalid: {message}")).await?;
                return self.release_finalizer(&key).await;
            }
            Err(err) => {
                if self.orphan_due(task, machine).await {
                    self.orphan(&key, "host unreachable past orphan grace").await?;
                    return self.release_finalizer(&key).await;
                }
                return self.session_setback(&key, err).await;
            }
        };

        let machine_slot = self.action_locks.lock(machine.key()).await;
        let outcome = self.finalize_remote(&session, task).await;
        drop(machine_slot);
        self.sessions.release(&session).await;

        match outcome {
            Ok(FinalizeRemote::NeverApplied) => self.release_finalizer(&key).await,
            Ok(FinalizeRemote::Recovered) => {
                self.forget_retries(&key);
                self.persist_status(&key, |status| {
                    status.phase = TaskPhase::Recovered;
                    status.recovered_at = Some(Utc::now());
                    status.last_error = None;
                })
                .await?;
                info!(task = %key, "Fault recovered before deletion");
                self.release_finalizer(&key).await
            }
            Err(err) => self.action_setback(&key, machine, err, false).await,
        }
    }

    /// Cancellation is allowed only if the fault never landed; anything at
    /// or past Applied is recovered first.
    async fn finalize_remote(
        &self,
        session: &Session,
        task: &ExperimentTask,
    ) -> Result<FinalizeRemote, AgentError> {
        let Some(fault_id) = task.fault_id() else {
            return Ok(FinalizeRemote::NeverApplied);
        };
        if task.status.phase == TaskPhase::Applying {
            if let FaultState::Absent = self.call_verify(session, fault_id).await? {
                return Ok(FinalizeRemote::NeverApplied);
            }
        }
        self.call_recover(session, fault_id).await?;
        Ok(FinalizeRemote::Recovered)
    }

    async fn orphan_due(&self, task: &ExperimentTask, machine: &PhysicalMachine) -> bool {
        if self.sessions.health(&machine.key()).await != SessionHealth::Unreachable {
            return false;
        }
        let Some(deleted_at) = task.meta.deletion_timestamp else {
            return false;
        };
        Utc::now().signed_duration_since(deleted_at).to_std().unwrap_or(Duration::ZERO)
            >= self.orphan_grace
    }

    /// Records that the fault could not be confirmed recovered.
    async fn orphan(
        &self,
        key: &ObjectKey,
        reason: &str,
    ) -> Result<(), StoreError> {
        warn!(task = %key, reason, "Releasing task without confirmed recovery");
        self.persist_status(key, |status| {
            status.orphaned = true;
            if !status.phase.is_terminal() {
                status.phase = TaskPhase::Recovering;
            }
            status.last_error = Some(StatusError::new(ErrorKind::Unreachable, reason));
        })
        .await?;
        Ok(())
    }

    async fn release_finalizer(
        &self,
        key: &ObjectKey,
    ) -> Result<Progress, StoreError> {
        self.forget_retries(key);
        match modify(&self.tasks, key, |task| {
            task.meta.remove_finalizer(TASK_FINALIZER);
        })
        .await
        {
            Ok(_) => Ok(Progress::Terminal),
            Err(err) if err.is_not_found() => Ok(Progress::Terminal),
            Err(err) => Err(err),
        }
    }

    async fn connect(&self, machine: &PhysicalMachine) -> Result<Session, TaskSetback> {
        let endpoint = resolve(&machine.spec.address, &self.allowed_schemes)
            .map_err(|err| TaskSetback::Config(err.to_string()))?;
        self.sessions
            .acquire(&machine.key(), &endpoint, machine.spec.credentials.as_deref())
            .await
            .map_err(TaskSetback::Session)
    }

    /// Folds a session-level failure into task status and decides requeue.
    async fn session_setback(
        &self,
        key: &ObjectKey,
        setback: TaskSetback,
    ) -> Result<Progress, StoreError> {
        match setback {
            TaskSetback::Config(message) => self.fail(key, ErrorKind::Config, &message).await,
            TaskSetback::Session(err) => {
                let status_error = err.to_status_error();
                self.persist_status(key, |status| {
                    status.last_error = Some(status_error.clone());
                })
                .await?;
                match err.retry_after() {
                    Some(delay) => Ok(Progress::Requeue(delay)),
                    // Latched (auth) or config-level: resync re-examines.
                    None => Ok(Progress::Settled),
                }
            }
        }
    }

    /// Folds an agent-call failure into task status and decides requeue.
    /// `may_fail` is true for apply/verify, the only steps allowed to turn
    /// a permanent error into `Failed`.
    async fn action_setback(
        &self,
        key: &ObjectKey,
        machine: &PhysicalMachine,
        err: AgentError,
        may_fail: bool,
    ) -> Result<Progress, StoreError> {
        if matches!(err, AgentError::AuthRejected) {
            // Token went stale mid-session; re-establish and retry.
            self.sessions.evict_session(&machine.key()).await;
            self.persist_status(key, |status| {
                status.last_error = Some(StatusError::new(
                    ErrorKind::Auth,
                    "session token rejected mid-call, re-establishing",
                ));
            })
            .await?;
            return Ok(Progress::Requeue(self.policy.jittered_delay_for(1)));
        }

        if err.class().is_transient() {
            let delay = self.next_delay(key);
            let status_error = status_error_for(&err);
            self.persist_status(key, |status| {
                status.last_error = Some(status_error.clone());
            })
            .await?;
            return Ok(Progress::Requeue(delay));
        }

        if may_fail {
            let status_error = status_error_for(&err);
            warn!(task = %key, error = %err, "Apply rejected, task failed");
            self.forget_retries(key);
            self.persist_status(key, |status| {
                status.phase = TaskPhase::Failed;
                status.last_error = Some(status_error.clone());
            })
            .await?;
            return Ok(Progress::Terminal);
        }

        // Permanent error during recovery: keep driving at the ceiling.
        let status_error = status_error_for(&err);
        self.persist_status(key, |status| {
            status.last_error = Some(status_error.clone());
        })
        .await?;
        Ok(Progress::Requeue(self.policy.max_delay))
    }

    async fn fail(
        &self,
        key: &ObjectKey,
        kind: ErrorKind,
        message: &str,
    ) -> Result<Progress, StoreError> {
        warn!(task = %key, error = message, "Task failed");
        self.forget_retries(key);
        self.persist_status(key, |status| {
            status.phase = TaskPhase::Failed;
            status.last_error = Some(StatusError::new(kind, message));
        })
        .await?;
        Ok(Progress::Terminal)
    }

    /// Status write that skips committing when nothing would change, so
    /// level-triggered re-invocations do not generate write storms.
    pub(crate) async fn persist_status<F>(
        &self,
        key: &ObjectKey,
        f: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(&mut TaskStatus),
    {
        let current = self.tasks.get(key).await?;
        let mut desired = current.status.clone();
        f(&mut desired);
        if desired == current.status {
            return Ok(());
        }
        modify_status(&self.tasks, key, |task| f(&mut task.status)).await?;
        Ok(())
    }

    fn next_delay(&self, key: &ObjectKey) -> Duration {
        let attempts = match self.retries.lock() {
            Ok(mut retries) => retries.record_failure(&key.to_string()),
            Err(_) => 1,
        };
        self.policy.jittered_delay_for(attempts)
    }

    fn forget_retries(&self, key: &ObjectKey) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.clear(&key.to_string());
        }
    }

    async fn call_verify(
        &self,
        session: &Session,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        self.with_timeout(self.agent.verify_fault(&session.endpoint, &session.token, id))
            .await
    }

    async fn call_apply(
        &self,
        session: &Session,
        fault: &FaultSpec,
    ) -> Result<FaultState, AgentError> {
        self.with_timeout(self.agent.apply_fault(&session.endpoint, &session.token, fault))
            .await
    }

    async fn call_recover(
        &self,
        session: &Session,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        self.with_timeout(self.agent.recover_fault(&session.endpoint, &session.token, id))
            .await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, AgentError>>,
    ) -> Result<T, AgentError> {
        match tokio::time::timeout(self.action_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.action_timeout.as_millis() as u64)),
        }
    }
}

/// Session-stage failure: either the address never resolved or the session
/// manager reported a classified error.
enum TaskSetback {
    Config(String),
    Session(SessionError),
}

/// Outcome of the verify-then-apply sequence against the agent.
enum EnsureApplied {
    Active,
    NotPresent,
    RefusedDeleting,
}

/// Outcome of the pre-deletion verify/recover sequence.
enum FinalizeRemote {
    NeverApplied,
    Recovered,
}

fn status_error_for(err: &AgentError) -> StatusError {
    let kind = match err {
        AgentError::AuthRejected => ErrorKind::Auth,
        AgentError::Conflict { .. } => ErrorKind::Conflict,
        AgentError::UnsupportedFault(_) | AgentError::InvalidRequest(_) | AgentError::Protocol(_) => {
            ErrorKind::Config
        }
        AgentError::Connect(_) | AgentError::Timeout(_) | AgentError::TransportReset(_) => {
            ErrorKind::TransientNetwork
        }
        AgentError::Remote { status, .. } if *status >= 500 => ErrorKind::TransientNetwork,
        AgentError::Remote { .. } => ErrorKind::Internal,
    };
    StatusError::new(kind, err.to_string())
}
