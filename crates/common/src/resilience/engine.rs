//! The recovery engine
//!
//! [`RecoveryEngine`] owns the circuit breaker and statistics registries for
//! every service key it has seen and exposes the three execution modes:
//!
//! - [`execute_with_retry`](RecoveryEngine::execute_with_retry): bounded retry
//!   loop driven by a [`RetryStrategy`]
//! - [`execute_with_circuit_breaker`](RecoveryEngine::execute_with_circuit_breaker):
//!   a single call guarded by the service's breaker
//! - [`execute_with_policy`](RecoveryEngine::execute_with_policy): retry,
//!   breaker, per-kind overrides and fallback combined
//!
//! Engines are independent; share one behind an `Arc` to share state.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use super::circuit_breaker::{
    BreakerPermit, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitState, Transition,
};
use super::clock::{Clock, SystemClock};
use super::constants::{DEFAULT_HEALTH_WINDOW, DEFAULT_UNHEALTHY_FAILURE_RATE};
use super::error::{Classify, ConfigResult, ErrorKind, RecoveryError, RecoveryResult, TimeoutScope};
use super::policy::{Fallback, RecoveryPolicy};
use super::retry::{sleep_or_cancel, RetryContext, RetryStrategy};
use super::settings::ResilienceSettings;
use super::stats::{HealthReport, OperationOutcome, RecoveryStats, StatsRegistry};
use crate::error::{ErrorClassification, ErrorSeverity};

/// Attempt bookkeeping that survives a whole-policy timeout
#[derive(Debug, Default)]
struct PolicyProgress {
    attempts: u32,
    first_attempt_failed: bool,
}

/// Async resilience runtime with instance-owned per-service state
pub struct RecoveryEngine<C: Clock = SystemClock> {
    clock: Arc<C>,
    breakers: CircuitBreakerRegistry,
    stats: StatsRegistry,
    default_strategy: RetryStrategy,
    unhealthy_failure_rate: f64,
}

impl<C: Clock> fmt::Debug for RecoveryEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("breakers", &self.breakers.len())
            .field("default_strategy", &self.default_strategy)
            .field("unhealthy_failure_rate", &self.unhealthy_failure_rate)
            .finish()
    }
}

impl Default for RecoveryEngine<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine<SystemClock> {
    /// Engine with default settings and the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Engine configured from loaded settings
    pub fn from_settings(settings: &ResilienceSettings) -> ConfigResult<Self> {
        Self::with_clock_and_settings(SystemClock, settings)
    }
}

impl<C: Clock> RecoveryEngine<C> {
    /// Engine with default settings and a custom clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
            stats: StatsRegistry::new(DEFAULT_HEALTH_WINDOW),
            default_strategy: RetryStrategy::default(),
            unhealthy_failure_rate: DEFAULT_UNHEALTHY_FAILURE_RATE,
        }
    }

    pub fn with_clock_and_settings(clock: C, settings: &ResilienceSettings) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(Self {
            clock: Arc::new(clock),
            breakers: CircuitBreakerRegistry::new(settings.circuit_breaker.to_config()?),
            stats: StatsRegistry::new(settings.health.window),
            default_strategy: settings.retry.to_strategy()?,
            unhealthy_failure_rate: settings.health.unhealthy_failure_rate,
        })
    }

    /// Strategy derived from the engine's retry settings
    pub fn default_retry_strategy(&self) -> &RetryStrategy {
        &self.default_strategy
    }

    /// Breaker configuration used when a call supplies none
    pub fn default_circuit_breaker_config(&self) -> &CircuitBreakerConfig {
        self.breakers.default_config()
    }

    //--------------------------------------------------------------------------
    // Execution
    //--------------------------------------------------------------------------

    /// Run `operation` until it succeeds, fails non-retryably, or exhausts
    /// `strategy.max_attempts()`
    ///
    /// Attempts are strictly sequential. Exhausted and non-retryable failures
    /// are returned unchanged as [`RecoveryError::Operation`]. Statistics are
    /// recorded under `context.operation_id()` when one is set.
    #[instrument(
        skip(self, operation, strategy, context),
        fields(operation_id = context.operation_id().unwrap_or("anonymous"), max_attempts = strategy.max_attempts())
    )]
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        strategy: &RetryStrategy,
        context: &RetryContext,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let key = context.operation_id();
        let started = time::Instant::now();
        let mut attempt: u32 = 1;

        loop {
            if context.is_cancelled() {
                return Err(self.fail_operation(key, RecoveryError::Cancelled, started, attempt, attempt > 1));
            }

            let result = run_attempt(&mut operation, strategy.timeout()).await;
            if let Some(key) = key {
                self.stats.record_attempt(key, result.is_ok(), attempt > 1);
            }

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Operation succeeded after retry");
                    }
                    self.succeed_operation(key, started, attempt > 1, None);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !strategy.is_retryable(&error) {
                debug!(attempt, kind = %error.kind(), "Failure is not retryable");
                return Err(self.fail_operation(key, error, started, attempt, attempt > 1));
            }

            if attempt >= strategy.max_attempts() {
                warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                return Err(self.fail_operation(key, error, started, attempt, attempt > 1));
            }

            let delay = strategy.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying after delay"
            );

            if !sleep_or_cancel(delay, context.cancellation()).await {
                debug!(attempt, "Retry delay cancelled");
                return Err(self.fail_operation(key, RecoveryError::Cancelled, started, attempt, true));
            }

            attempt += 1;
        }
    }

    /// Run `operation` once through the breaker for `service`
    ///
    /// An open breaker rejects with [`RecoveryError::CircuitOpen`] without
    /// invoking `operation`. `config` replaces the breaker's stored
    /// configuration; without one the engine default is used for new keys.
    #[instrument(skip(self, operation, config), fields(service = %service))]
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        operation: F,
        service: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> RecoveryResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let started = time::Instant::now();
        let permit = match self.admit(service, config) {
            Ok(permit) => permit,
            Err(rejected) => return Err(self.fail_operation(Some(service), rejected, started, 0, false)),
        };

        match operation().await {
            Ok(value) => {
                self.settle_success(service, permit, started.elapsed());
                self.stats.record_attempt(service, true, false);
                self.succeed_operation(Some(service), started, false, None);
                Ok(value)
            }
            Err(error) => {
                self.settle_failure(service, permit);
                self.stats.record_attempt(service, false, false);
                Err(self.fail_operation(Some(service), RecoveryError::Operation(error), started, 1, false))
            }
        }
    }

    /// Run `operation` under a full recovery policy
    ///
    /// Every attempt passes through the breaker for `service`. A failure is
    /// charged to the strategy governing its kind: the override from
    /// `error_policies` if one exists, otherwise the default strategy. Each
    /// strategy keeps its own attempt count, which decides exhaustion and the
    /// next delay. When the primary path fails terminally (exhausted,
    /// non-retryable, circuit open, or policy timeout) the fallback runs; if
    /// it also fails the original failure is returned. A breaker rejection
    /// after at least one attempt surfaces the last operation failure;
    /// [`RecoveryError::CircuitOpen`] is only returned when the first attempt
    /// is rejected.
    #[instrument(
        skip(self, operation, policy),
        fields(service = %service, fallback = %policy.fallback().kind())
    )]
    pub async fn execute_with_policy<F, Fut, T, E>(
        &self,
        mut operation: F,
        service: &str,
        policy: &RecoveryPolicy<T, E>,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Clone,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let started = time::Instant::now();
        let mut progress = PolicyProgress::default();

        let result = {
            let attempts = self.run_policy_attempts(&mut operation, service, policy, &mut progress);
            match policy.timeout() {
                Some(budget) => match time::timeout(budget, attempts).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(budget_ms = budget.as_millis() as u64, "Recovery policy timed out");
                        Err(RecoveryError::Timeout { scope: TimeoutScope::Policy, budget })
                    }
                },
                None => attempts.await,
            }
        };

        let recovery = progress.first_attempt_failed;
        let error = match result {
            Ok(value) => {
                if let Fallback::Cache(cache) = policy.fallback() {
                    cache.put(service, value.clone()).await;
                }
                self.succeed_operation(Some(service), started, recovery, None);
                return Ok(value);
            }
            Err(error) => error,
        };

        if policy.fallback().is_none() {
            return Err(self.fail_operation(Some(service), error, started, progress.attempts, recovery));
        }

        self.stats.record_fallback(service);
        match self.run_fallback(service, policy.fallback()).await {
            Some(value) => {
                info!(
                    attempts = progress.attempts,
                    kind = %error.kind(),
                    "Fallback produced a result after terminal failure"
                );
                self.succeed_operation(Some(service), started, true, Some(error.kind()));
                Ok(value)
            }
            None => {
                warn!("Fallback failed, returning original failure");
                Err(self.fail_operation(Some(service), error, started, progress.attempts, true))
            }
        }
    }

    async fn run_policy_attempts<F, Fut, T, E>(
        &self,
        operation: &mut F,
        service: &str,
        policy: &RecoveryPolicy<T, E>,
        progress: &mut PolicyProgress,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let mut default_failures: u32 = 0;
        let mut override_failures: HashMap<ErrorKind, u32> = HashMap::new();
        let mut attempt_timeout = policy.retry_strategy().timeout();
        let mut last_error: Option<RecoveryError<E>> = None;

        loop {
            // A breaker tripped by this run's own failures ends it with the
            // failure that tripped it
            let permit = match self.admit(service, policy.circuit_breaker()) {
                Ok(permit) => permit,
                Err(rejected) => return Err(last_error.unwrap_or(rejected)),
            };

            progress.attempts += 1;
            let is_retry = progress.attempts > 1;
            let attempt_started = time::Instant::now();
            let result = run_attempt(operation, attempt_timeout).await;

            let error = match result {
                Ok(value) => {
                    self.settle_success(service, permit, attempt_started.elapsed());
                    self.stats.record_attempt(service, true, is_retry);
                    if is_retry {
                        info!(attempt = progress.attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            self.settle_failure(service, permit);
            self.stats.record_attempt(service, false, is_retry);
            if progress.attempts == 1 {
                progress.first_attempt_failed = true;
            }

            let kind = error.kind();
            let (strategy, failures) = match policy.override_for(&kind) {
                Some(strategy) => {
                    if !override_failures.contains_key(&kind) {
                        info!(kind = %kind, "Switching to error-specific retry strategy");
                    }
                    (strategy, override_failures.entry(kind.clone()).or_insert(0))
                }
                None => (policy.retry_strategy(), &mut default_failures),
            };
            *failures += 1;
            let charged = *failures;

            if !strategy.is_retryable(&error) {
                debug!(attempt = progress.attempts, kind = %kind, "Failure is not retryable");
                return Err(error);
            }

            if charged >= strategy.max_attempts() {
                warn!(
                    attempts = progress.attempts,
                    kind = %kind,
                    max_attempts = strategy.max_attempts(),
                    "Retry attempts exhausted"
                );
                return Err(error);
            }

            let delay = strategy.delay_for_attempt(charged);
            attempt_timeout = strategy.timeout();
            debug!(
                attempt = progress.attempts,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying after delay"
            );
            time::sleep(delay).await;
            last_error = Some(error);
        }
    }

    async fn run_fallback<T, E>(&self, service: &str, fallback: &Fallback<T, E>) -> Option<T>
    where
        E: std::error::Error,
    {
        match fallback {
            Fallback::None => None,
            Fallback::Function(produce) | Fallback::Endpoint(produce) => match produce().await {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(service, kind = %fallback.kind(), error = %error, "Fallback failed");
                    None
                }
            },
            Fallback::Cache(cache) => {
                let cached = cache.get(service).await;
                if cached.is_none() {
                    debug!(service, "Fallback cache miss");
                }
                cached
            }
        }
    }

    //--------------------------------------------------------------------------
    // Breaker plumbing
    //--------------------------------------------------------------------------

    fn admit<E>(
        &self,
        service: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> Result<BreakerPermit, RecoveryError<E>> {
        self.breakers.try_acquire(service, config, self.clock.now()).map_err(|rejection| {
            self.stats.record_activation(service);
            debug!(service, retry_after = ?rejection.retry_after, "Circuit breaker rejected call");
            RecoveryError::CircuitOpen {
                service: service.to_string(),
                retry_after: rejection.retry_after,
            }
        })
    }

    fn settle_success(&self, service: &str, permit: BreakerPermit, elapsed: Duration) {
        let transition = permit.record_success(self.clock.now(), elapsed);
        self.note_transition(service, transition);
    }

    fn settle_failure(&self, service: &str, permit: BreakerPermit) {
        let transition = permit.record_failure(self.clock.now());
        self.note_transition(service, transition);
    }

    fn note_transition(&self, service: &str, transition: Transition) {
        if transition == Transition::Tripped {
            self.stats.record_trip(service);
        }
    }

    //--------------------------------------------------------------------------
    // Outcome recording
    //--------------------------------------------------------------------------

    fn succeed_operation(
        &self,
        key: Option<&str>,
        started: time::Instant,
        recovery: bool,
        absorbed: Option<ErrorKind>,
    ) {
        if let Some(key) = key {
            let outcome = OperationOutcome {
                succeeded: true,
                recovery,
                duration: started.elapsed(),
                error_kind: absorbed,
            };
            self.stats.record_operation(key, &outcome);
        }
    }

    fn fail_operation<E>(
        &self,
        key: Option<&str>,
        error: RecoveryError<E>,
        started: time::Instant,
        attempts: u32,
        recovery: bool,
    ) -> RecoveryError<E>
    where
        E: std::error::Error + Classify + 'static,
    {
        let kind = error.kind();
        log_terminal_failure(key.unwrap_or("anonymous"), &error, attempts);

        if let Some(key) = key {
            let outcome = OperationOutcome {
                succeeded: false,
                recovery,
                duration: started.elapsed(),
                error_kind: Some(kind),
            };
            self.stats.record_operation(key, &outcome);
        }

        error
    }

    //--------------------------------------------------------------------------
    // Stats and health
    //--------------------------------------------------------------------------

    /// Accumulated stats for `key`; zeroed for unseen keys
    pub fn get_recovery_stats(&self, key: &str) -> RecoveryStats {
        self.stats.get(key)
    }

    /// Clear stats for `key`, or for every key when `None`
    pub fn reset_stats(&self, key: Option<&str>) {
        self.stats.reset(key);
        info!(key = key.unwrap_or("*"), "Recovery stats reset");
    }

    /// Health across every service known to the engine
    pub fn get_health_metrics(&self) -> HealthReport {
        let generated_at = DateTime::<Utc>::from(self.clock.system_time());
        HealthReport::compile(&self.stats, &self.breakers, self.unhealthy_failure_rate, generated_at)
    }

    //--------------------------------------------------------------------------
    // Breaker administration
    //--------------------------------------------------------------------------

    /// Breaker view for `service`; unseen keys report closed with no failures
    pub fn get_circuit_breaker_state(&self, service: &str) -> CircuitBreakerSnapshot {
        self.breakers.snapshot(service)
    }

    /// Force the breaker for `service` open, restarting its cooldown
    pub fn open_circuit_breaker(&self, service: &str) {
        self.breakers.open(service, self.clock.now());
    }

    /// Force the breaker for `service` into `state`
    ///
    /// `Open` restarts the cooldown and `Closed` clears the failure count.
    /// Calls already in flight settle against the new state.
    pub fn set_circuit_breaker_state(&self, service: &str, state: CircuitState) {
        self.breakers.set_state(service, state, self.clock.now());
    }

    /// Forget the breaker for `service`; returns whether one existed
    pub fn reset_circuit_breaker(&self, service: &str) -> bool {
        self.breakers.reset(service)
    }

    /// Drop every breaker and all statistics
    pub fn reset_all(&self) {
        self.breakers.reset_all();
        self.stats.reset(None);
        info!("Recovery engine state reset");
    }
}

async fn run_attempt<F, Fut, T, E>(operation: &mut F, timeout: Option<Duration>) -> RecoveryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(budget) => match time::timeout(budget, operation()).await {
            Ok(result) => result.map_err(RecoveryError::Operation),
            Err(_) => Err(RecoveryError::Timeout { scope: TimeoutScope::Attempt, budget }),
        },
        None => operation().await.map_err(RecoveryError::Operation),
    }
}

fn log_terminal_failure<E>(key: &str, error: &RecoveryError<E>, attempts: u32)
where
    E: std::error::Error + Classify + 'static,
{
    let kind = error.kind();
    match error.severity() {
        ErrorSeverity::Info => info!(key, attempts, kind = %kind, error = %error, "Operation failed"),
        ErrorSeverity::Warning => {
            warn!(key, attempts, kind = %kind, error = %error, "Operation failed");
        }
        ErrorSeverity::Error | ErrorSeverity::Critical => {
            error!(key, attempts, kind = %kind, error = %error, "Operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::CommonError;
    use crate::resilience::clock::MockClock;
    use crate::resilience::policy::{create_recovery_policy, fallback_fn, RecoveryPolicyOptions};

    fn fast_strategy(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .no_jitter()
            .build()
            .expect("valid strategy")
    }

    fn network() -> CommonError {
        CommonError::backend("api", "connection reset", true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_failure_when_exhausted() {
        let engine = RecoveryEngine::new();
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), CommonError> = engine
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(CommonError::backend("api", format!("failure {n}"), true)) }
                },
                &fast_strategy(4),
                &RetryContext::for_operation("exhaust"),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.expect_err("all attempts fail").into_operation().expect("operation error");
        assert!(err.to_string().contains("failure 4"), "Last failure must surface: {err}");

        let stats = engine.get_recovery_stats("exhaust");
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.total_retries, 3);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.failed_recoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried_then_surfaces() {
        let engine = RecoveryEngine::new();
        let strategy = RetryStrategy::builder()
            .max_attempts(2)
            .base_delay(Duration::from_millis(1))
            .timeout(Duration::from_millis(50))
            .no_jitter()
            .build()
            .expect("valid strategy");

        let result: RecoveryResult<(), CommonError> = engine
            .execute_with_retry(
                || async {
                    time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
                &strategy,
                &RetryContext::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RecoveryError::Timeout { scope: TimeoutScope::Attempt, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_delay() {
        let engine = RecoveryEngine::new();
        let context = RetryContext::for_operation("cancel");
        let token = context.cancellation().clone();
        let strategy = RetryStrategy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_secs(3600))
            .no_jitter()
            .build()
            .expect("valid strategy");

        let canceller = tokio::spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        });

        let result: RecoveryResult<(), CommonError> = engine
            .execute_with_retry(|| async { Err(network()) }, &strategy, &context)
            .await;
        canceller.await.expect("canceller task");

        assert!(matches!(result, Err(RecoveryError::Cancelled)));
        assert_eq!(engine.get_recovery_stats("cancel").total_attempts, 1);
    }

    #[tokio::test]
    async fn test_anonymous_context_records_nothing() {
        let engine = RecoveryEngine::new();
        let value: RecoveryResult<u32, CommonError> = engine
            .execute_with_retry(|| async { Ok(7) }, &fast_strategy(1), &RetryContext::new())
            .await;

        assert_eq!(value.expect("success"), 7);
        assert_eq!(engine.get_health_metrics().total_services, 0);
    }

    #[tokio::test]
    async fn test_breaker_counts_trips_and_activations() {
        let engine = RecoveryEngine::with_clock(MockClock::new());
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .reset_timeout(Duration::from_secs(1))
            .build()
            .expect("valid config");

        for _ in 0..2 {
            let _: RecoveryResult<(), CommonError> = engine
                .execute_with_circuit_breaker(|| async { Err(network()) }, "svc", Some(&config))
                .await;
        }
        let rejected: RecoveryResult<(), CommonError> = engine
            .execute_with_circuit_breaker(|| async { Ok(()) }, "svc", Some(&config))
            .await;

        assert!(rejected.expect_err("breaker open").is_circuit_open());
        let stats = engine.get_recovery_stats("svc");
        assert_eq!(stats.circuit_breaker_trips, 1);
        assert_eq!(stats.circuit_breaker_activations, 1);
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.error_distribution.get(&ErrorKind::CircuitOpen), Some(&1));
    }

    #[tokio::test]
    async fn test_slow_success_is_returned_but_counts_against_breaker() {
        let engine = RecoveryEngine::with_clock(MockClock::new());
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .timeout_threshold(Duration::from_millis(20))
            .build()
            .expect("valid config");

        let value: RecoveryResult<&str, CommonError> = engine
            .execute_with_circuit_breaker(
                || async {
                    time::sleep(Duration::from_millis(40)).await;
                    Ok("late")
                },
                "slow",
                Some(&config),
            )
            .await;

        assert_eq!(value.expect("value still returned"), "late");
        assert_eq!(engine.get_circuit_breaker_state("slow").state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_fallback_failure_returns_original_error() {
        let engine = RecoveryEngine::new();
        let options = RecoveryPolicyOptions::<u32, CommonError>::new(fast_strategy(2))
            .with_fallback_function(fallback_fn(|| async {
                Err(CommonError::internal("fallback broke"))
            }));
        let policy = create_recovery_policy(options).expect("valid policy");

        let result = engine.execute_with_policy(|| async { Err(network()) }, "orders", &policy).await;

        let err = result.expect_err("fallback failed").into_operation().expect("original error");
        assert!(matches!(err, CommonError::Backend { .. }));
        assert_eq!(engine.get_recovery_stats("orders").fallback_invocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_timeout_applies_fallback() {
        let engine = RecoveryEngine::new();
        let options = RecoveryPolicyOptions::<u32, CommonError>::new(fast_strategy(3))
            .with_timeout(Duration::from_millis(100))
            .with_fallback_function(fallback_fn(|| async { Ok(0) }));
        let policy = create_recovery_policy(options).expect("valid policy");

        let value = engine
            .execute_with_policy(
                || async {
                    time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                },
                "reports",
                &policy,
            )
            .await;

        assert_eq!(value.expect("fallback value"), 0);
        let stats = engine.get_recovery_stats("reports");
        assert_eq!(stats.error_distribution.get(&ErrorKind::Timeout), Some(&1));
        assert_eq!(stats.successful_operations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_timeout_without_fallback() {
        let engine = RecoveryEngine::new();
        let options = RecoveryPolicyOptions::<u32, CommonError>::new(fast_strategy(3))
            .with_timeout(Duration::from_millis(100));
        let policy = create_recovery_policy(options).expect("valid policy");

        let result = engine
            .execute_with_policy(
                || async {
                    time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                },
                "reports",
                &policy,
            )
            .await;

        assert!(matches!(
            result,
            Err(RecoveryError::Timeout { scope: TimeoutScope::Policy, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_all_clears_everything() {
        let engine = RecoveryEngine::new();
        engine.open_circuit_breaker("a");
        let _: RecoveryResult<(), CommonError> = engine
            .execute_with_retry(|| async { Ok(()) }, &fast_strategy(1), &RetryContext::for_operation("b"))
            .await;

        assert_eq!(engine.get_health_metrics().total_services, 2);
        engine.reset_all();
        assert_eq!(engine.get_health_metrics().total_services, 0);
        assert!(!engine.reset_circuit_breaker("a"));
    }
}
