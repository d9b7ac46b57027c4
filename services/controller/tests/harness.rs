//! Test harness for controller integration tests.
//!
//! Provides a scripted in-process agent fleet, wiring to run the full
//! controller against in-memory collections, and polling helpers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use faultline_address::{Endpoint, Scheme};
use faultline_backoff::BackoffPolicy;
use faultline_controller::client::AgentApi;
use faultline_controller::config::ControllerConfig;
use faultline_controller::controller::Controller;
use faultline_controller::session::SessionManager;
use faultline_store::{
    Collection, ExperimentTask, FaultDescriptor, MachineSpec, Object, ObjectKey, ObjectMeta,
    PhysicalMachine, ResourceEvent, TaskPhase, TaskSpec,
};
use faultline_wire::{
    AgentError, FaultId, FaultKind, FaultSpec, FaultState, HealthResponse, SessionToken,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Scripted stand-in for a fleet of host agents, no network involved.
///
/// Faults are keyed by `(endpoint, fault id)` so one fake serves several
/// machines. Tokens are checked the way a real agent would: calls holding
/// a revoked token fail with `AuthRejected`.
pub struct FakeAgent {
    state: Mutex<FakeState>,
    pub authenticate_calls: AtomicU64,
    pub apply_calls: AtomicU64,
    pub verify_calls: AtomicU64,
    pub recover_calls: AtomicU64,
    pub health_calls: AtomicU64,
    actions_in_flight: AtomicU64,
    max_actions_in_flight: AtomicU64,
    action_delay_ms: AtomicU64,
}

#[derive(Default)]
struct FakeState {
    faults: HashMap<(String, FaultId), FaultKind>,
    valid_tokens: HashSet<String>,
    token_seq: u64,
    required_credential: Option<String>,
    refuse_connections: bool,
    drop_next_apply: bool,
    drop_next_recover: bool,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            authenticate_calls: AtomicU64::new(0),
            apply_calls: AtomicU64::new(0),
            verify_calls: AtomicU64::new(0),
            recover_calls: AtomicU64::new(0),
            health_calls: AtomicU64::new(0),
            actions_in_flight: AtomicU64::new(0),
            max_actions_in_flight: AtomicU64::new(0),
            action_delay_ms: AtomicU64::new(0),
        })
    }

    /// Accept only this credential; everything else is rejected.
    pub fn require_credential(&self, credential: &str) {
        self.state.lock().unwrap().required_credential = Some(credential.to_string());
    }

    /// Refuse (or stop refusing) TCP connections, like a dead host.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }

    /// The next apply lands on the host but the response is lost and all
    /// session tokens are revoked, as if the agent restarted mid-call.
    pub fn script_dropped_apply(&self) {
        self.state.lock().unwrap().drop_next_apply = true;
    }

    /// The next recover removes the fault but its reply is lost in
    /// transit; the session token stays valid.
    pub fn script_dropped_recover(&self) {
        self.state.lock().unwrap().drop_next_recover = true;
    }

    /// Marks a fault slot occupied by something the controller does not own.
    pub fn occupy_slot(&self, address: &str, kind: FaultKind) {
        let foreign = FaultId::for_task(Ulid::new());
        self.state
            .lock()
            .unwrap()
            .faults
            .insert((address.to_string(), foreign), kind);
    }

    /// Remote actions take at least this long, to widen race windows.
    pub fn set_action_delay(&self, delay: Duration) {
        self.action_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn active_fault_count(&self) -> usize {
        self.state.lock().unwrap().faults.len()
    }

    pub fn has_fault(&self, address: &str, id: FaultId) -> bool {
        self.state
            .lock()
            .unwrap()
            .faults
            .contains_key(&(address.to_string(), id))
    }

    /// Highest number of overlapping apply/verify/recover calls observed.
    pub fn max_concurrent_actions(&self) -> u64 {
        self.max_actions_in_flight.load(Ordering::SeqCst)
    }

    fn enter_action(&self) -> ActionGuard<'_> {
        let now = self.actions_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_actions_in_flight.fetch_max(now, Ordering::SeqCst);
        ActionGuard(self)
    }

    fn refused(&self) -> bool {
        self.state.lock().unwrap().refuse_connections
    }

    fn token_valid(&self, token: &SessionToken) -> bool {
        self.state
            .lock()
            .unwrap()
            .valid_tokens
            .contains(token.reveal())
    }

    async fn action_delay(&self) {
        let ms = self.action_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

struct ActionGuard<'a>(&'a FakeAgent);

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.0.actions_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn authenticate(
        &self,
        _endpoint: &Endpoint,
        credentials: Option<&str>,
    ) -> Result<SessionToken, AgentError> {
        if self.refused() {
            return Err(AgentError::Connect("connection refused".to_string()));
        }
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if let Some(required) = &state.required_credential {
            if credentials != Some(required.as_str()) {
                return Err(AgentError::AuthRejected);
            }
        }
        state.token_seq += 1;
        let token = format!("tok-{}", state.token_seq);
        state.valid_tokens.insert(token.clone());
        Ok(SessionToken::new(token))
    }

    async fn apply_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        fault: &FaultSpec,
    ) -> Result<FaultState, AgentError> {
        let _guard = self.enter_action();
        if self.refused() {
            return Err(AgentError::Connect("connection refused".to_string()));
        }
        self.action_delay().await;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if !self.token_valid(token) {
            return Err(AgentError::AuthRejected);
        }

        let mut state = self.state.lock().unwrap();
        let host = endpoint.to_string();
        let occupied = state
            .faults
            .iter()
            .any(|(key, kind)| key.0 == host && *kind == fault.kind && key.1 != fault.id);
        if occupied {
            return Err(AgentError::Conflict {
                active_kind: Some(fault.kind),
            });
        }

        state.faults.insert((host, fault.id), fault.kind);
        if state.drop_next_apply {
            state.drop_next_apply = false;
            state.valid_tokens.clear();
            return Err(AgentError::TransportReset(
                "connection reset during apply".to_string(),
            ));
        }
        Ok(FaultState::Active)
    }

    async fn verify_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        let _guard = self.enter_action();
        if self.refused() {
            return Err(AgentError::Connect("connection refused".to_string()));
        }
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if !self.token_valid(token) {
            return Err(AgentError::AuthRejected);
        }

        let state = self.state.lock().unwrap();
        let present = state.faults.contains_key(&(endpoint.to_string(), id));
        Ok(if present {
            FaultState::Active
        } else {
            FaultState::Absent
        })
    }

    async fn recover_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        let _guard = self.enter_action();
        if self.refused() {
            return Err(AgentError::Connect("connection refused".to_string()));
        }
        self.action_delay().await;
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        if !self.token_valid(token) {
            return Err(AgentError::AuthRejected);
        }

        let mut state = self.state.lock().unwrap();
        state.faults.remove(&(endpoint.to_string(), id));
        if state.drop_next_recover {
            state.drop_next_recover = false;
            return Err(AgentError::TransportReset(
                "connection reset during recover".to_string(),
            ));
        }
        Ok(FaultState::Absent)
    }

    async fn health_check(
        &self,
        _endpoint: &Endpoint,
        token: &SessionToken,
    ) -> Result<HealthResponse, AgentError> {
        if self.refused() {
            return Err(AgentError::Connect("connection refused".to_string()));
        }
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if !self.token_valid(token) {
            return Err(AgentError::AuthRejected);
        }
        let state = self.state.lock().unwrap();
        Ok(HealthResponse {
            ok: true,
            active_faults: state.faults.len() as u32,
        })
    }
}

/// A full controller running against in-memory collections and the fake
/// agent fleet.
pub struct TestCluster {
    pub machines: Collection<PhysicalMachine>,
    pub tasks: Collection<ExperimentTask>,
    pub agent: Arc<FakeAgent>,
    pub sessions: Arc<SessionManager>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestCluster {
    pub async fn start(agent: Arc<FakeAgent>, config: ControllerConfig) -> Self {
        let machines: Collection<PhysicalMachine> = Collection::new();
        let tasks: Collection<ExperimentTask> = Collection::new();
        let controller = Controller::new(config, machines.clone(), tasks.clone(), agent.clone());
        let sessions = controller.sessions();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown_rx));

        Self {
            machines,
            tasks,
            agent,
            sessions,
            shutdown,
            handle,
        }
    }

    /// Stops the control loop and waits for it to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Timings tuned so every scenario converges in well under a second per
/// step: short backoff, frequent resync, long probe and unreachable
/// windows so they stay out of the way unless a test opts in.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        connect_timeout: Duration::from_millis(250),
        action_timeout: Duration::from_millis(500),
        health_probe_interval: Duration::from_secs(30),
        session_idle_timeout: Duration::from_secs(60),
        resync_interval: Duration::from_millis(200),
        unreachable_probe_interval: Duration::from_secs(60),
        orphan_grace: Duration::from_millis(300),
        backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            ceiling_attempts: 3,
        },
        allowed_schemes: vec![Scheme::Http, Scheme::Https],
        log_level: "debug".to_string(),
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new("chaos", name)
}

pub fn machine(name: &str, address: &str) -> PhysicalMachine {
    PhysicalMachine::new(
        ObjectMeta::new("chaos", name),
        MachineSpec {
            address: address.to_string(),
            credentials: None,
        },
    )
}

pub fn task(
    name: &str,
    machine: &str,
    kind: FaultKind,
    duration_secs: Option<u64>,
) -> ExperimentTask {
    ExperimentTask::new(
        ObjectMeta::new("chaos", name),
        TaskSpec {
            machine: machine.to_string(),
            fault: FaultDescriptor {
                kind,
                params: serde_json::Value::Null,
            },
            duration_secs,
        },
    )
}

/// Polls the condition every 10ms, failing the test after 10 seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_phase(
    tasks: &Collection<ExperimentTask>,
    key: &ObjectKey,
    phase: TaskPhase,
) {
    let started = Instant::now();
    loop {
        if let Ok(task) = tasks.get(key).await {
            if task.status.phase == phase {
                return;
            }
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "timed out waiting for task {key} to reach {phase}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_gone<T: Object>(collection: &Collection<T>, key: &ObjectKey) {
    let started = Instant::now();
    loop {
        match collection.get(key).await {
            Err(err) if err.is_not_found() => return,
            _ => {}
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "timed out waiting for {} {key} to be removed",
            T::KIND
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collapses a drained event stream into its sequence of distinct phases.
pub fn phase_transitions(
    events: &mut UnboundedReceiver<ResourceEvent<ExperimentTask>>,
) -> Vec<TaskPhase> {
    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ResourceEvent::Changed(task) = event {
            if phases.last() != Some(&task.status.phase) {
                phases.push(task.status.phase);
            }
        }
    }
    phases
}
