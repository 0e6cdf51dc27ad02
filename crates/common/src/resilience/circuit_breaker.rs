//! Per-service circuit breakers
//!
//! The registry keeps one breaker per service key. Each breaker sits behind
//! its own mutex, so admission checks and outcome recording are atomic for
//! callers sharing a key while different keys never contend.
//!
//! State machine:
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(reset_timeout elapsed, checked at call time)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)--> Open
//! ```
//!
//! A half-open breaker admits a single trial call. Callers arriving while the
//! trial is in flight are rejected as if the breaker were open.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::constants::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT};
use super::error::{ConfigError, ConfigResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without running
    Open,
    /// One trial call decides whether to close or reopen
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for one service's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial is allowed
    #[serde(with = "crate::utils::duration_millis")]
    pub reset_timeout: Duration,
    /// Attempts slower than this count as failures even when they succeed
    #[serde(default, with = "crate::utils::option_duration_millis")]
    pub timeout_threshold: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            timeout_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.timeout_threshold.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("timeout_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn timeout_threshold(mut self, threshold: Duration) -> Self {
        self.config.timeout_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub config: CircuitBreakerConfig,
}

impl CircuitBreakerSnapshot {
    fn closed(config: CircuitBreakerConfig) -> Self {
        Self { state: CircuitState::Closed, failures: 0, last_failure: None, config }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}

/// Mutable state of one breaker
#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    config: CircuitBreakerConfig,
    trial_in_flight: bool,
}

impl BreakerEntry {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            config,
            trial_in_flight: false,
        }
    }

    fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            failures: self.failures,
            last_failure: self.last_failure,
            config: self.config.clone(),
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure = Some(now);
        self.trial_in_flight = false;
    }
}

/// A rejected admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejection {
    /// Remaining cooldown, unknown while a half-open trial is in flight
    pub retry_after: Option<Duration>,
}

/// State change caused by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    None,
    /// Closed to open after reaching the failure threshold
    Tripped,
    /// A half-open trial failed
    Reopened,
    /// A half-open trial succeeded
    Closed,
}

/// Permission to run one attempt through a breaker
///
/// The outcome must be reported through [`record_success`](Self::record_success)
/// or [`record_failure`](Self::record_failure). Dropping an unsettled permit
/// (the attempt was cancelled) releases a half-open trial slot without
/// changing the breaker's counters.
#[derive(Debug)]
pub(crate) struct BreakerPermit {
    service: String,
    entry: Arc<Mutex<BreakerEntry>>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a completed attempt that returned `Ok` after `elapsed`
    ///
    /// An attempt slower than the configured `timeout_threshold` is recorded
    /// as a failure.
    pub fn record_success(mut self, now: Instant, elapsed: Duration) -> Transition {
        self.settled = true;
        let mut entry = self.entry.lock();
        if self.trial {
            entry.trial_in_flight = false;
        }

        if let Some(threshold) = entry.config.timeout_threshold {
            if elapsed > threshold {
                warn!(
                    service = %self.service,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Slow call exceeded timeout threshold, counting as failure"
                );
                return Self::apply_failure(&self.service, &mut entry, now);
            }
        }

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Closed;
                entry.failures = 0;
                info!(service = %self.service, "Circuit breaker closed after successful trial");
                Transition::Closed
            }
            CircuitState::Closed => {
                entry.failures = 0;
                Transition::None
            }
            // Opened by another caller or administratively while this
            // attempt was running; the cooldown stands
            CircuitState::Open => {
                entry.failures = 0;
                Transition::None
            }
        }
    }

    /// Record a failed attempt
    pub fn record_failure(mut self, now: Instant) -> Transition {
        self.settled = true;
        let mut entry = self.entry.lock();
        if self.trial {
            entry.trial_in_flight = false;
        }
        Self::apply_failure(&self.service, &mut entry, now)
    }

    fn apply_failure(service: &str, entry: &mut BreakerEntry, now: Instant) -> Transition {
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = Some(now);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.open(now);
                warn!(service, failures = entry.failures, "Half-open trial failed, circuit reopened");
                Transition::Reopened
            }
            CircuitState::Closed if entry.failures >= entry.config.failure_threshold => {
                entry.open(now);
                warn!(
                    service,
                    failures = entry.failures,
                    threshold = entry.config.failure_threshold,
                    "Circuit breaker opened"
                );
                Transition::Tripped
            }
            _ => {
                debug!(service, failures = entry.failures, "Circuit breaker recorded failure");
                Transition::None
            }
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.entry.lock().trial_in_flight = false;
            debug!(service = %self.service, "Half-open trial abandoned");
        }
    }
}

/// Engine-owned map of service key to breaker
#[derive(Debug)]
pub(crate) struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<BreakerEntry>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Load or create the breaker for `service`
    ///
    /// A supplied config replaces the stored one; the breaker's state and
    /// counters are kept.
    fn entry(&self, service: &str, config: Option<&CircuitBreakerConfig>) -> Arc<Mutex<BreakerEntry>> {
        let entry = match self.breakers.get(service) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let initial = config.unwrap_or(&self.default_config).clone();
                let created = self
                    .breakers
                    .entry(service.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new(initial))));
                Arc::clone(created.value())
            }
        };

        if let Some(config) = config {
            let mut guard = entry.lock();
            if guard.config != *config {
                guard.config = config.clone();
            }
        }

        entry
    }

    /// Decide whether an attempt for `service` may run
    pub fn try_acquire(
        &self,
        service: &str,
        config: Option<&CircuitBreakerConfig>,
        now: Instant,
    ) -> Result<BreakerPermit, Rejection> {
        let entry = self.entry(service, config);
        let trial = {
            let mut guard = entry.lock();
            match guard.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let elapsed = guard
                        .last_failure
                        .map_or(guard.config.reset_timeout, |at| now.saturating_duration_since(at));
                    if elapsed < guard.config.reset_timeout {
                        return Err(Rejection {
                            retry_after: Some(guard.config.reset_timeout - elapsed),
                        });
                    }
                    guard.state = CircuitState::HalfOpen;
                    guard.trial_in_flight = true;
                    info!(service, "Circuit breaker half-open, admitting trial call");
                    true
                }
                CircuitState::HalfOpen => {
                    if guard.trial_in_flight {
                        return Err(Rejection { retry_after: None });
                    }
                    guard.trial_in_flight = true;
                    true
                }
            }
        };

        Ok(BreakerPermit { service: service.to_string(), entry, trial, settled: false })
    }

    /// Current view of `service`; unseen keys report a closed breaker
    pub fn snapshot(&self, service: &str) -> CircuitBreakerSnapshot {
        match self.breakers.get(service) {
            Some(entry) => entry.value().lock().snapshot(),
            None => CircuitBreakerSnapshot::closed(self.default_config.clone()),
        }
    }

    /// State of `service` if a breaker exists for it
    pub fn state_of(&self, service: &str) -> Option<CircuitState> {
        self.breakers.get(service).map(|entry| entry.value().lock().state)
    }

    /// Snapshots of every known breaker
    pub fn snapshots(&self) -> Vec<(String, CircuitBreakerSnapshot)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().snapshot()))
            .collect()
    }

    /// Force `service` open, restarting its cooldown
    pub fn open(&self, service: &str, now: Instant) {
        self.set_state(service, CircuitState::Open, now);
    }

    /// Force `service` into `state`
    pub fn set_state(&self, service: &str, state: CircuitState, now: Instant) {
        let entry = self.entry(service, None);
        let mut guard = entry.lock();
        let previous = guard.state;

        match state {
            CircuitState::Open => guard.open(now),
            CircuitState::Closed => {
                guard.state = CircuitState::Closed;
                guard.failures = 0;
                guard.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::HalfOpen;
                guard.trial_in_flight = false;
            }
        }

        info!(service, from = %previous, to = %state, "Circuit breaker state set manually");
    }

    /// Forget the breaker for `service`
    pub fn reset(&self, service: &str) -> bool {
        self.breakers.remove(service).is_some()
    }

    pub fn reset_all(&self) {
        self.breakers.clear();
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }
}
