//! Agent session cache.
//!
//! At most one logical session exists per machine. The cache is the
//! exclusive owner of per-machine connection state: callers get cloneable
//! handles and classified errors, never the slot itself. Establishment for
//! one machine is serialized on that machine's slot lock; other machines
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use faultline_address::Endpoint;
use faultline_backoff::{BackoffPolicy, BackoffState};
use faultline_store::{ErrorKind, ObjectKey, SessionHealth, StatusError};
use faultline_wire::{AgentError, SessionToken};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::AgentApi;
use crate::config::ControllerConfig;

/// Why a session could not be produced.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// Transient failure; worth retrying after the embedded delay.
    #[error("session attempt failed ({message}), retry in {}ms", retry_after.as_millis())]
    Transient {
        retry_after: Duration,
        message: String,
    },

    /// Past the retry ceiling; probed at reduced frequency.
    #[error("machine unreachable, next probe in {}s", retry_after.as_secs())]
    Unreachable { retry_after: Duration },

    /// Credentials rejected. Latched until the machine spec changes.
    #[error("agent rejected credentials")]
    AuthRejected,

    /// The endpoint answers but is not a usable fault agent.
    #[error("agent endpoint rejected the protocol: {0}")]
    Config(String),
}

impl SessionError {
    /// Delay after which another attempt could succeed, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SessionError::Transient { retry_after, .. }
            | SessionError::Unreachable { retry_after } => Some(*retry_after),
            SessionError::AuthRejected | SessionError::Config(_) => None,
        }
    }

    /// Status rendering of this failure.
    #[must_use]
    pub fn to_status_error(&self) -> StatusError {
        match self {
            SessionError::Transient { message, .. } => {
                StatusError::new(ErrorKind::TransientNetwork, message.clone())
            }
            SessionError::Unreachable { .. } => StatusError::new(
                ErrorKind::Unreachable,
                "host unreachable past retry ceiling",
            ),
            SessionError::AuthRejected => {
                StatusError::new(ErrorKind::Auth, "agent rejected credentials")
            }
            SessionError::Config(message) => StatusError::new(ErrorKind::Config, message.clone()),
        }
    }
}

/// Cloneable handle to an established session.
#[derive(Debug, Clone)]
pub struct Session {
    pub machine: ObjectKey,
    pub endpoint: Endpoint,
    pub token: SessionToken,
    pub established_at: Instant,
}

/// Read-only snapshot of one machine's connection state, for status folding.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub health: SessionHealth,
    pub last_reachable_at: Option<DateTime<Utc>>,
    pub last_error: Option<StatusError>,
}

struct Slot {
    endpoint: Option<Endpoint>,
    session: Option<Session>,
    health: SessionHealth,
    backoff: BackoffState,
    /// Earliest next establishment attempt while backing off.
    next_attempt_at: Option<Instant>,
    /// Earliest next probe while unreachable.
    unreachable_until: Option<Instant>,
    /// Credential value the agent rejected; attempts with the same value
    /// fail fast without touching the network.
    rejected_credential: Option<Option<String>>,
    last_used: Instant,
    last_probe: Instant,
    last_reachable_at: Option<DateTime<Utc>>,
    last_error: Option<StatusError>,
    connect_attempts: u64,
}

impl Slot {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            endpoint: None,
            session: None,
            health: SessionHealth::Unknown,
            backoff: BackoffState::new(),
            next_attempt_at: None,
            unreachable_until: None,
            rejected_credential: None,
            last_used: now,
            last_probe: now,
            last_reachable_at: None,
            last_error: None,
            connect_attempts: 0,
        }
    }

    /// Forgets all failure state. Used when the target effectively changed.
    fn reset_failures(&mut self) {
        self.backoff.reset();
        self.next_attempt_at = None;
        self.unreachable_until = None;
        self.rejected_credential = None;
        self.health = SessionHealth::Unknown;
        self.last_error = None;
    }
}

/// Owns every per-machine session slot.
pub struct SessionManager {
    agent: Arc<dyn AgentApi>,
    policy: BackoffPolicy,
    probe_interval: Duration,
    idle_timeout: Duration,
    unreachable_probe_interval: Duration,
    slots: Mutex<HashMap<ObjectKey, Arc<Mutex<Slot>>>>,
}

impl SessionManager {
    pub fn new(agent: Arc<dyn AgentApi>, config: &ControllerConfig) -> Self {
        Self {
            agent,
            policy: config.backoff.clone(),
            probe_interval: config.health_probe_interval,
            idle_timeout: config.session_idle_timeout,
            unreachable_probe_interval: config.unreachable_probe_interval,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, machine: &ObjectKey) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(machine.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::new()))),
        )
    }

    /// Returns a session for the machine, establishing one if needed.
    ///
    /// A cached healthy session is returned without network traffic. The
    /// slot lock is held for the whole establishment attempt, so concurrent
    /// callers for one machine never race duplicate connects.
    pub async fn acquire(
        &self,
        machine: &ObjectKey,
        endpoint: &Endpoint,
        credentials: Option<&str>,
    ) -> Result<Session, SessionError> {
        let slot = self.slot(machine).await;
        let mut s = slot.lock().await;
        let now = Instant::now();

        // A different endpoint means a different agent: prior failures,
        // latches, and sessions no longer say anything about it.
        if s.endpoint.as_ref() != Some(endpoint) {
            s.endpoint = Some(endpoint.clone());
            s.session = None;
            s.reset_failures();
        }

        if let Some(latched) = &s.rejected_credential {
            if latched.as_deref() == credentials {
                return Err(SessionError::AuthRejected);
            }
            // Credential changed: the latch no longer applies.
            s.reset_failures();
        }

        if let Some(session) = s.session.clone() {
            s.last_used = now;
            return Ok(session);
        }

        if s.health == SessionHealth::Unreachable {
            if let Some(until) = s.unreachable_until {
                if now < until {
                    return Err(SessionError::Unreachable {
                        retry_after: until - now,
                    });
                }
            }
        } else if let Some(at) = s.next_attempt_at {
            if now < at {
                return Err(SessionError::Transient {
                    retry_after: at - now,
                    message: "waiting out backoff".to_string(),
                });
            }
        }

        s.connect_attempts += 1;
        let token = match self.agent.authenticate(endpoint, credentials).await {
            Ok(token) => token,
            Err(err) => return Err(self.record_failure(&mut s, machine, credentials, err)),
        };

        // Establishment includes an initial probe; a token from an agent
        // that cannot answer health is not a usable session.
        match self.agent.health_check(endpoint, &token).await {
            Ok(health) if health.ok => {}
            Ok(_) => {
                let err = AgentError::Remote {
                    status: 503,
                    message: "agent reports unhealthy".to_string(),
                };
                return Err(self.record_failure(&mut s, machine, credentials, err));
            }
            Err(err) => return Err(self.record_failure(&mut s, machine, credentials, err)),
        }

        let session = Session {
            machine: machine.clone(),
            endpoint: endpoint.clone(),
            token,
            established_at: now,
        };
        s.session = Some(session.clone());
        s.health = SessionHealth::Connected;
        s.backoff.reset();
        s.next_attempt_at = None;
        s.unreachable_until = None;
        s.rejected_credential = None;
        s.last_error = None;
        s.last_used = now;
        s.last_probe = now;
        s.last_reachable_at = Some(Utc::now());

        info!(machine = %machine, endpoint = %endpoint, "Agent session established");
        Ok(session)
    }

    fn record_failure(
        &self,
        s: &mut Slot,
        machine: &ObjectKey,
        credentials: Option<&str>,
        err: AgentError,
    ) -> SessionError {
        let now = Instant::now();
        s.session = None;

        if matches!(err, AgentError::AuthRejected) {
            s.rejected_credential = Some(credentials.map(str::to_string));
            s.health = SessionHealth::AuthFailed;
            s.backoff.reset();
            s.next_attempt_at = None;
            s.unreachable_until = None;
            let session_err = SessionError::AuthRejected;
            s.last_error = Some(session_err.to_status_error());
            warn!(machine = %machine, "Agent rejected credentials, holding until spec changes");
            return session_err;
        }

        if err.class().is_transient() {
            s.backoff.record_failure();
            let attempts = s.backoff.attempts();

            if self.policy.exhausted(attempts) {
                s.health = SessionHealth::Unreachable;
                s.next_attempt_at = None;
                s.unreachable_until = Some(now + self.unreachable_probe_interval);
                let session_err = SessionError::Unreachable {
                    retry_after: self.unreachable_probe_interval,
                };
                s.last_error = Some(session_err.to_status_error());
                warn!(
                    machine = %machine,
                    attempts,
                    probe_interval_secs = self.unreachable_probe_interval.as_secs(),
                    "Machine unreachable, reducing probe frequency"
                );
                return session_err;
            }

            s.health = SessionHealth::Unhealthy;
            let delay = self.policy.jittered_delay_for(attempts);
            s.next_attempt_at = Some(now + delay);
            let session_err = SessionError::Transient {
                retry_after: delay,
                message: err.to_string(),
            };
            s.last_error = Some(session_err.to_status_error());
            debug!(machine = %machine, attempts, error = %err, "Session attempt failed");
            return session_err;
        }

        // Permanent non-auth rejection during establishment: the address
        // points at something that is not speaking our protocol.
        s.health = SessionHealth::ConfigRejected;
        s.next_attempt_at = None;
        let session_err = SessionError::Config(err.to_string());
        s.last_error = Some(session_err.to_status_error());
        warn!(machine = %machine, error = %err, "Agent endpoint rejected the protocol");
        session_err
    }

    /// Returns a session handle to the cache, refreshing its idle clock.
    /// Never closes the underlying session.
    pub async fn release(&self, session: &Session) {
        let slot = self.slot(&session.machine).await;
        let mut s = slot.lock().await;
        s.last_used = Instant::now();
    }

    /// Tears down and forgets the machine's slot entirely.
    pub async fn invalidate(&self, machine: &ObjectKey) {
        let mut slots = self.slots.lock().await;
        if slots.remove(machine).is_some() {
            debug!(machine = %machine, "Session slot invalidated");
        }
    }

    /// Drops a cached session so the next acquire re-establishes, keeping
    /// backoff and latch state. Used when a call over the session failed.
    pub async fn evict_session(&self, machine: &ObjectKey) {
        let slot = self.slot(machine).await;
        let mut s = slot.lock().await;
        if s.session.take().is_some() {
            debug!(machine = %machine, "Session evicted");
        }
    }

    /// Keep-alive pass over every cached session.
    ///
    /// Probes sessions past their probe interval, evicts ones that fail or
    /// sat idle past the idle timeout. Returns machines whose health
    /// changed so the caller can requeue them. Slots busy establishing are
    /// skipped; they are not idle.
    pub async fn probe_sessions(&self) -> Vec<ObjectKey> {
        let slots: Vec<(ObjectKey, Arc<Mutex<Slot>>)> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut changed = Vec::new();
        for (machine, slot) in slots {
            let Ok(mut s) = slot.try_lock() else {
                continue;
            };
            let now = Instant::now();
            let Some(session) = s.session.clone() else {
                continue;
            };

            if now.duration_since(s.last_used) >= self.idle_timeout {
                s.session = None;
                s.health = SessionHealth::Unknown;
                debug!(machine = %machine, "Evicting idle session");
                changed.push(machine);
                continue;
            }

            if now.duration_since(s.last_probe) < self.probe_interval {
                continue;
            }
            s.last_probe = now;

            match self
                .agent
                .health_check(&session.endpoint, &session.token)
                .await
            {
                Ok(health) if health.ok => {
                    s.last_reachable_at = Some(Utc::now());
                }
                Ok(_) => {
                    self.mark_probe_failure(&mut s, &machine, "agent reports unhealthy");
                    changed.push(machine);
                }
                Err(err) => {
                    self.mark_probe_failure(&mut s, &machine, &err.to_string());
                    changed.push(machine);
                }
            }
        }
        changed
    }

    fn mark_probe_failure(&self, s: &mut Slot, machine: &ObjectKey, message: &str) {
        s.session = None;
        s.health = SessionHealth::Unhealthy;
        s.backoff.record_failure();
        s.next_attempt_at = Some(Instant::now() + self.policy.jittered_delay_for(s.backoff.attempts()));
        s.last_error = Some(StatusError::new(ErrorKind::TransientNetwork, message));
        warn!(machine = %machine, error = %message, "Session failed keep-alive, evicting");
    }

    /// Read-only view of the machine's connection state.
    pub async fn status_view(&self, machine: &ObjectKey) -> SessionView {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(machine).map(Arc::clone)
        };
        match slot {
            Some(slot) => {
                let s = slot.lock().await;
                SessionView {
                    health: s.health,
                    last_reachable_at: s.last_reachable_at,
                    last_error: s.last_error.clone(),
                }
            }
            None => SessionView::default(),
        }
    }

    /// Current health of the machine's slot.
    pub async fn health(&self, machine: &ObjectKey) -> SessionHealth {
        self.status_view(machine).await.health
    }

    /// Number of real authenticate calls made for this machine.
    pub async fn connect_attempts(&self, machine: &ObjectKey) -> u64 {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(machine).map(Arc::clone)
        };
        match slot {
            Some(slot) => slot.lock().await.connect_attempts,
            None => 0,
        }
    }
}
