//! Level-triggered reconciliation of machines and tasks.
//!
//! Each invocation reads desired and observed state fresh, computes the
//! single next action, and tolerates redundant or missed notifications;
//! the periodic resync re-enqueues everything, so a dropped event only
//! delays convergence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use faultline_address::{resolve, Scheme};
use faultline_backoff::BackoffPolicy;
use faultline_store::{
    modify, Collection, ErrorKind, ExperimentTask, MachineStatus, Object, ObjectKey,
    PhysicalMachine, SessionHealth, StatusError, StoreError, TaskPhase,
};
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, Progress, TASK_FINALIZER};
use crate::queue::{Reason, ResourceKind, WorkItem, WorkQueue};
use crate::session::SessionManager;

/// Finalizer gating machine deletion on task recovery and session teardown.
pub const MACHINE_FINALIZER: &str = "faultline.sh/teardown";

pub struct Reconciler {
    machines: Collection<PhysicalMachine>,
    tasks: Collection<ExperimentTask>,
    sessions: Arc<SessionManager>,
    dispatcher: Dispatcher,
    queue: WorkQueue,
    allowed_schemes: Vec<Scheme>,
    policy: BackoffPolicy,
    orphan_grace: Duration,
}

impl Reconciler {
    pub fn new(
        machines: Collection<PhysicalMachine>,
        tasks: Collection<ExperimentTask>,
        sessions: Arc<SessionManager>,
        dispatcher: Dispatcher,
        queue: WorkQueue,
        config: &crate::config::ControllerConfig,
    ) -> Self {
        Self {
            machines,
            tasks,
            sessions,
            dispatcher,
            queue,
            allowed_schemes: config.allowed_schemes.clone(),
            policy: config.backoff.clone(),
            orphan_grace: config.orphan_grace,
        }
    }

    /// Runs one reconcile pass for the item. Never panics the worker:
    /// store-level failures are logged and retried.
    pub async fn reconcile(&self, item: &WorkItem) {
        let result = match item.kind {
            ResourceKind::Machine => self.reconcile_machine(&item.key, item.reason).await,
            ResourceKind::Task => self.reconcile_task(&item.key).await,
        };

        if let Err(err) = result {
            warn!(kind = %item.kind, key = %item.key, error = %err, "Reconcile pass failed, retrying");
            self.queue
                .requeue_after(item.clone(), self.policy.initial_delay);
        }
    }

    async fn reconcile_machine(&self, key: &ObjectKey, reason: Reason) -> Result<(), StoreError> {
        let mut machine = match self.machines.get(key).await {
            Ok(machine) => machine,
            Err(err) if err.is_not_found() => {
                // Object gone: only the session slot is left to clean up.
                self.sessions.invalidate(key).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if machine.meta.is_deleting() {
            return self.finalize_machine(machine).await;
        }

        if !machine.meta.has_finalizer(MACHINE_FINALIZER) {
            machine = modify(&self.machines, key, |m| {
                m.meta.add_finalizer(MACHINE_FINALIZER);
            })
            .await?;
        }

        // Address must resolve before anything touches the network. A bad
        // address is terminal config, never retried as transient.
        if let Err(err) = resolve(&machine.spec.address, &self.allowed_schemes) {
            let message = err.to_string();
            debug!(machine = %key, error = %message, "Machine address rejected");
            self.persist_machine_status(key, |status| {
                status.session = SessionHealth::ConfigRejected;
                status.last_error = Some(StatusError::new(ErrorKind::Config, message.clone()));
            })
            .await?;
            return Ok(());
        }

        // Sessions are established on dispatch demand, not here; reconcile
        // only folds the manager's current view into status.
        let view = self.sessions.status_view(key).await;
        self.persist_machine_status(key, |status| {
            status.session = view.health;
            if view.last_reachable_at.is_some() {
                status.last_reachable_at = view.last_reachable_at;
            }
            status.last_error = view.last_error.clone();
        })
        .await?;

        // A spec edit (address, credentials) may unblock waiting tasks.
        if reason == Reason::Changed {
            for task in self.referencing_tasks(&machine).await {
                self.queue.enqueue(WorkItem::task(task.key(), Reason::Changed));
            }
        }
        Ok(())
    }

    /// Machine deletion: every referencing task is driven through recovery
    /// before the finalizer comes off, unless the host stayed unreachable
    /// past the orphan grace.
    async fn finalize_machine(&self, machine: PhysicalMachine) -> Result<(), StoreError> {
        let key = machine.key();
        let referencing: Vec<ExperimentTask> = self
            .referencing_tasks(&machine)
            .await
            .into_iter()
            .filter(|task| !task.status.phase.is_terminal())
            .collect();

        if referencing.is_empty() {
            self.sessions.invalidate(&key).await;
            match modify(&self.machines, &key, |m| {
                m.meta.remove_finalizer(MACHINE_FINALIZER);
            })
            .await
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            info!(machine = %key, "Machine deleted");
            return Ok(());
        }

        if self.orphan_due(&machine).await {
            for task in &referencing {
                let task_key = task.key();
                warn!(
                    machine = %key,
                    task = %task_key,
                    "Host unreachable past orphan grace, releasing task without recovery"
                );
                self.dispatcher
                    .persist_status(&task_key, |status| {
                        status.orphaned = true;
                        if !status.phase.is_terminal() {
                            status.phase = TaskPhase::Recovering;
                        }
                        status.last_error = Some(StatusError::new(
                            ErrorKind::Unreachable,
                            "machine deleted while unreachable",
                        ));
                    })
                    .await?;
            }
            self.sessions.invalidate(&key).await;
            match modify(&self.machines, &key, |m| {
                m.meta.remove_finalizer(MACHINE_FINALIZER);
            })
            .await
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            warn!(machine = %key, orphaned = referencing.len(), "Machine deleted with orphaned tasks");
            return Ok(());
        }

        // Push each live task toward recovery, then come back.
        for task in referencing {
            let task_key = task.key();
            if matches!(task.status.phase, TaskPhase::Applied | TaskPhase::Expired) {
                self.dispatcher
                    .persist_status(&task_key, |status| {
                        if !status.phase.is_terminal() {
                            status.phase = TaskPhase::Recovering;
                        }
                    })
                    .await?;
            }
            self.queue.enqueue(WorkItem::task(task_key, Reason::Retry));
        }
        self.queue.requeue_after(
            WorkItem::machine(key, Reason::Retry),
            self.policy.initial_delay,
        );
        Ok(())
    }

    async fn reconcile_task(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut task = match self.tasks.get(key).await {
            Ok(task) => task,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        if !task.meta.is_deleting()
            && !task.status.phase.is_terminal()
            && !task.meta.has_finalizer(TASK_FINALIZER)
        {
            task = modify(&self.tasks, key, |t| {
                t.meta.add_finalizer(TASK_FINALIZER);
            })
            .await?;
        }

        let machine_key = ObjectKey::new(task.meta.namespace.clone(), task.spec.machine.clone());
        let machine = match self.machines.get(&machine_key).await {
            Ok(machine) => Some(machine),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        if task.meta.is_deleting() {
            let progress = self.dispatcher.finalize(&task, machine.as_ref()).await?;
            self.apply_progress(key, progress);
            return Ok(());
        }

        let Some(machine) = machine else {
            return self.task_without_machine(&task).await;
        };

        let progress = self.dispatcher.advance(&task, &machine).await?;
        self.apply_progress(key, progress);

        // Dispatch may have moved the machine's session health; let the
        // machine pass fold it into status.
        if self.sessions.health(&machine_key).await != machine.status.session {
            self.queue
                .enqueue(WorkItem::machine(machine_key, Reason::Retry));
        }
        Ok(())
    }

    /// A task whose referenced machine does not exist.
    async fn task_without_machine(&self, task: &ExperimentTask) -> Result<(), StoreError> {
        let key = task.key();
        match task.status.phase {
            TaskPhase::Pending => {
                warn!(task = %key, machine = %task.spec.machine, "Referenced machine not found, task failed");
                self.dispatcher
                    .persist_status(&key, |status| {
                        status.phase = TaskPhase::Failed;
                        status.last_error = Some(StatusError::new(
                            ErrorKind::Config,
                            "referenced machine not found",
                        ));
                    })
                    .await?;
            }
            phase if phase.fault_may_be_active() => {
                // The machine left while the fault may still be on the
                // host. Machine deletion already drove or orphaned its
                // tasks; this records the stragglers.
                self.dispatcher
                    .persist_status(&key, |status| {
                        status.orphaned = true;
                        if !status.phase.is_terminal() {
                            status.phase = TaskPhase::Recovering;
                        }
                        status.last_error = Some(StatusError::new(
                            ErrorKind::Unreachable,
                            "referenced machine no longer exists",
                        ));
                    })
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_progress(&self, key: &ObjectKey, progress: Progress) {
        match progress {
            Progress::Requeue(delay) => {
                self.queue
                    .requeue_after(WorkItem::task(key.clone(), Reason::Timer), delay);
            }
            Progress::Settled | Progress::Terminal => {}
        }
    }

    async fn referencing_tasks(&self, machine: &PhysicalMachine) -> Vec<ExperimentTask> {
        self.tasks
            .list()
            .await
            .into_iter()
            .filter(|task| {
                task.meta.namespace == machine.meta.namespace
                    && task.spec.machine == machine.meta.name
            })
            .collect()
    }

    async fn orphan_due(&self, machine: &PhysicalMachine) -> bool {
        if self.sessions.health(&machine.key()).await != SessionHealth::Unreachable {
            return false;
        }
        let Some(deleted_at) = machine.meta.deletion_timestamp else {
            return false;
        };
        Utc::now()
            .signed_duration_since(deleted_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
            >= self.orphan_grace
    }

    /// Machine status write that skips committing when nothing changed.
    async fn persist_machine_status<F>(&self, key: &ObjectKey, f: F) -> Result<(), StoreError>
    where
        F: Fn(&mut MachineStatus),
    {
        let current = self.machines.get(key).await?;
        let mut desired = current.status.clone();
        f(&mut desired);
        if desired == current.status {
            return Ok(());
        }
        faultline_store::modify_status(&self.machines, key, |machine| f(&mut machine.status))
            .await?;
        Ok(())
    }
}
