//! Controller wiring: watch pumps, tickers, and the reconcile worker pool.

use std::sync::Arc;
use std::time::Duration;

use faultline_store::{
    Collection, ExperimentTask, Object, ObjectKey, PhysicalMachine, ResourceEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::client::AgentApi;
use crate::config::ControllerConfig;
use crate::dispatch::Dispatcher;
use crate::queue::{KeyedLocks, Reason, ResourceKind, WorkItem, WorkQueue};
use crate::reconcile::Reconciler;
use crate::session::SessionManager;

/// Owns every moving part of the control loop.
pub struct Controller {
    config: ControllerConfig,
    machines: Collection<PhysicalMachine>,
    tasks: Collection<ExperimentTask>,
    sessions: Arc<SessionManager>,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    rx: UnboundedReceiver<WorkItem>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        machines: Collection<PhysicalMachine>,
        tasks: Collection<ExperimentTask>,
        agent: Arc<dyn AgentApi>,
    ) -> Self {
        let (queue, rx) = WorkQueue::new();
        let sessions = Arc::new(SessionManager::new(Arc::clone(&agent), &config));
        let dispatcher = Dispatcher::new(
            tasks.clone(),
            Arc::clone(&sessions),
            agent,
            &config,
        );
        let reconciler = Arc::new(Reconciler::new(
            machines.clone(),
            tasks.clone(),
            Arc::clone(&sessions),
            dispatcher,
            queue.clone(),
            &config,
        ));

        Self {
            config,
            machines,
            tasks,
            sessions,
            reconciler,
            queue,
            rx,
        }
    }

    /// Read-only handle to the session manager, for status inspection.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    /// Runs until the shutdown signal flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "Starting controller");

        let locks: Arc<KeyedLocks<(ResourceKind, ObjectKey)>> = Arc::new(KeyedLocks::new());
        let rx = Arc::new(Mutex::new(self.rx));
        let mut handles = Vec::new();

        // Watches registered before the initial enumeration so nothing
        // slips between list and watch; duplicates are harmless.
        let machine_events = self.machines.watch().await;
        let task_events = self.tasks.watch().await;
        for machine in self.machines.list().await {
            self.queue
                .enqueue(WorkItem::machine(machine.key(), Reason::Resync));
        }
        for task in self.tasks.list().await {
            self.queue.enqueue(WorkItem::task(task.key(), Reason::Resync));
        }

        handles.push(tokio::spawn(pump_events(
            machine_events,
            ResourceKind::Machine,
            self.queue.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(pump_events(
            task_events,
            ResourceKind::Task,
            self.queue.clone(),
            shutdown.clone(),
        )));

        handles.push(tokio::spawn(resync_loop(
            self.machines.clone(),
            self.tasks.clone(),
            self.queue.clone(),
            Arc::clone(&locks),
            self.config.resync_interval,
            shutdown.clone(),
        )));

        handles.push(tokio::spawn(probe_loop(
            Arc::clone(&self.sessions),
            self.queue.clone(),
            self.config.health_probe_interval,
            shutdown.clone(),
        )));

        for worker_id in 0..self.config.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&locks),
                Arc::clone(&self.reconciler),
                shutdown.clone(),
            )));
        }

        let mut shutdown_wait = shutdown;
        loop {
            if *shutdown_wait.borrow() {
                break;
            }
            if shutdown_wait.changed().await.is_err() {
                break;
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Controller stopped");
    }
}

/// Forwards store change notifications into the work queue.
async fn pump_events<T: Object>(
    mut events: UnboundedReceiver<ResourceEvent<T>>,
    kind: ResourceKind,
    queue: WorkQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let key = match event {
                    ResourceEvent::Changed(obj) => obj.key(),
                    ResourceEvent::Deleted(key) => key,
                };
                queue.enqueue(WorkItem { kind, key, reason: Reason::Changed });
            }
        }
    }
}

/// Periodic full re-enumeration; the self-healing half of level triggering.
async fn resync_loop(
    machines: Collection<PhysicalMachine>,
    tasks: Collection<ExperimentTask>,
    queue: WorkQueue,
    locks: Arc<KeyedLocks<(ResourceKind, ObjectKey)>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate tick; startup already enumerated.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let machine_list = machines.list().await;
                let task_list = tasks.list().await;
                debug!(machines = machine_list.len(), tasks = task_list.len(), "Resync");
                for machine in machine_list {
                    queue.enqueue(WorkItem::machine(machine.key(), Reason::Resync));
                }
                for task in task_list {
                    queue.enqueue(WorkItem::task(task.key(), Reason::Resync));
                }
                locks.prune().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Keep-alive probing of cached sessions.
async fn probe_loop(
    sessions: Arc<SessionManager>,
    queue: WorkQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for machine in sessions.probe_sessions().await {
                    queue.enqueue(WorkItem::machine(machine, Reason::Timer));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One reconcile worker: pulls items, locks the identity, reconciles.
async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<UnboundedReceiver<WorkItem>>>,
    locks: Arc<KeyedLocks<(ResourceKind, ObjectKey)>>,
    reconciler: Arc<Reconciler>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Reconcile worker started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            item = async { rx.lock().await.recv().await } => {
                let Some(item) = item else { break };
                let _guard = locks.lock((item.kind, item.key.clone())).await;
                reconciler.reconcile(&item).await;
            }
        }
    }
    debug!(worker_id, "Reconcile worker stopped");
}
