//! Configuration for the controller.

use std::time::Duration;

use anyhow::Result;
use faultline_address::Scheme;
use faultline_backoff::BackoffPolicy;

/// Controller configuration.
///
/// Every tunable has a default; environment variables override. Malformed
/// values fall back to the default rather than aborting startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,

    /// TCP connect timeout for agent calls.
    pub connect_timeout: Duration,

    /// Deadline for one remote action (apply, verify, recover, probe).
    pub action_timeout: Duration,

    /// How often established sessions are health probed.
    pub health_probe_interval: Duration,

    /// Idle sessions older than this are evicted from the cache.
    pub session_idle_timeout: Duration,

    /// Full resync period: every machine and task is re-enqueued.
    pub resync_interval: Duration,

    /// Probe frequency for machines past the retry ceiling.
    pub unreachable_probe_interval: Duration,

    /// How long a deleting machine may stay unreachable before its tasks
    /// are released as orphaned.
    pub orphan_grace: Duration,

    /// Retry backoff for transient session and agent failures.
    pub backoff: BackoffPolicy,

    /// URL schemes accepted in machine addresses.
    pub allowed_schemes: Vec<Scheme>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            connect_timeout: Duration::from_secs(5),
            action_timeout: Duration::from_secs(30),
            health_probe_interval: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(300),
            resync_interval: Duration::from_secs(60),
            unreachable_probe_interval: Duration::from_secs(120),
            orphan_grace: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            allowed_schemes: vec![Scheme::Http, Scheme::Https],
            log_level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let default_backoff = BackoffPolicy::default();

        let backoff = BackoffPolicy {
            initial_delay: env_millis("FAULTLINE_BACKOFF_INITIAL_MS")
                .unwrap_or(default_backoff.initial_delay),
            max_delay: env_secs("FAULTLINE_BACKOFF_MAX_SECS").unwrap_or(default_backoff.max_delay),
            multiplier: default_backoff.multiplier,
            ceiling_attempts: env_var("FAULTLINE_BACKOFF_CEILING")
                .unwrap_or(default_backoff.ceiling_attempts),
        };

        let allowed_schemes = std::env::var("FAULTLINE_ALLOWED_SCHEMES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| s.trim().parse::<Scheme>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|schemes| !schemes.is_empty())
            .unwrap_or(defaults.allowed_schemes);

        Ok(Self {
            workers: env_var("FAULTLINE_WORKERS").unwrap_or(defaults.workers),
            connect_timeout: env_secs("FAULTLINE_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            action_timeout: env_secs("FAULTLINE_ACTION_TIMEOUT_SECS")
                .unwrap_or(defaults.action_timeout),
            health_probe_interval: env_secs("FAULTLINE_HEALTH_PROBE_INTERVAL_SECS")
                .unwrap_or(defaults.health_probe_interval),
            session_idle_timeout: env_secs("FAULTLINE_SESSION_IDLE_TIMEOUT_SECS")
                .unwrap_or(defaults.session_idle_timeout),
            resync_interval: env_secs("FAULTLINE_RESYNC_INTERVAL_SECS")
                .unwrap_or(defaults.resync_interval),
            unreachable_probe_interval: env_secs("FAULTLINE_UNREACHABLE_PROBE_INTERVAL_SECS")
                .unwrap_or(defaults.unreachable_probe_interval),
            orphan_grace: env_secs("FAULTLINE_ORPHAN_GRACE_SECS").unwrap_or(defaults.orphan_grace),
            backoff,
            allowed_schemes,
            log_level: std::env::var("FAULTLINE_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_var::<u64>(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_var::<u64>(name).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = ControllerConfig::default();
        assert!(config.workers > 0);
        assert!(config.backoff.ceiling_attempts > 0);
        assert!(config.orphan_grace > Duration::ZERO);
        assert_eq!(config.allowed_schemes, vec![Scheme::Http, Scheme::Https]);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("FAULTLINE_WORKERS", "2");
        std::env::set_var("FAULTLINE_ORPHAN_GRACE_SECS", "90");
        std::env::set_var("FAULTLINE_BACKOFF_CEILING", "7");
        std::env::set_var("FAULTLINE_ALLOWED_SCHEMES", "https");

        let config = ControllerConfig::from_env().unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.orphan_grace, Duration::from_secs(90));
        assert_eq!(config.backoff.ceiling_attempts, 7);
        assert_eq!(config.allowed_schemes, vec![Scheme::Https]);

        std::env::remove_var("FAULTLINE_WORKERS");
        std::env::remove_var("FAULTLINE_ORPHAN_GRACE_SECS");
        std::env::remove_var("FAULTLINE_BACKOFF_CEILING");
        std::env::remove_var("FAULTLINE_ALLOWED_SCHEMES");
    }
}
