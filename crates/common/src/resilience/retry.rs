//! Retry strategies: backoff, jitter and retryability
//!
//! A [`RetryStrategy`] is an immutable description of how a failed attempt
//! is retried. The bounded retry loop that consumes it lives on
//! [`RecoveryEngine`](super::RecoveryEngine).
//!
//! # Delay formula
//!
//! For the 1-indexed attempt `a` that just failed:
//!
//! | Backoff | Delay before attempt `a + 1` |
//! |---------|------------------------------|
//! | `Exponential { multiplier }` | `base_delay × multiplier^(a-1)` |
//! | `Linear` | `base_delay × a` |
//! | `Fixed` | `base_delay` |
//!
//! The result is capped at `max_delay`. With jitter enabled the capped delay
//! is scaled by a uniform factor drawn from `[1 − jitter_factor, 1 + jitter_factor]`
//! and is not re-capped afterwards.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY,
};
use super::error::{Classify, ConfigError, ConfigResult, ErrorKind, RecoveryError};

/// Shared predicate deciding whether an error may be retried
type ErrorPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Caller-supplied retry predicate
///
/// For operation failures the predicate sees the caller's own error, so it
/// can `downcast_ref` to the concrete type. Engine failures (attempt
/// timeouts) are passed as the engine error.
#[derive(Clone)]
pub struct RetryCondition(ErrorPredicate);

impl RetryCondition {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Evaluate the predicate
    pub fn matches(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        (self.0)(error)
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetryCondition(<function>)")
    }
}

/// Growth of the retry delay across attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base × multiplier^(attempt-1)`; a multiplier of 1 gives a constant delay
    Exponential { multiplier: f64 },
    /// `base × attempt`
    Linear,
    /// Always `base`
    Fixed,
}

impl Backoff {
    /// Multiplier applied per attempt (1 for linear and fixed growth)
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Exponential { multiplier } => *multiplier,
            Self::Linear | Self::Fixed => 1.0,
        }
    }

    /// Uncapped delay after the 1-indexed `attempt` failed
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Exponential { multiplier } => {
                let nanos = base.as_nanos() as f64 * multiplier.powf(f64::from(attempt - 1));
                if !nanos.is_finite() || nanos >= u64::MAX as f64 {
                    Duration::from_nanos(u64::MAX)
                } else {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                }
            }
            Self::Linear => base.saturating_mul(attempt),
            Self::Fixed => base,
        }
    }
}

/// Named retry presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// Multiplier 2 with jitter
    Exponential,
    /// Delay grows by `base_delay` per attempt, no jitter
    Linear,
    /// Constant delay, no jitter
    Fixed,
}

impl RetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for RetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            _ => Err(ConfigError::UnknownStrategy { name: s.to_string() }),
        }
    }
}

/// Immutable retry configuration
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: Backoff,
    max_delay: Option<Duration>,
    jitter: bool,
    jitter_factor: f64,
    retryable_errors: Option<HashSet<ErrorKind>>,
    retry_condition: Option<RetryCondition>,
    timeout: Option<Duration>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::preset(RetryKind::Exponential)
    }
}

impl RetryStrategy {
    /// Start a builder from the exponential preset
    pub fn builder() -> RetryStrategyBuilder {
        RetryStrategyBuilder::new()
    }

    /// Preset defaults for `kind`
    pub fn preset(kind: RetryKind) -> Self {
        let (backoff, jitter) = match kind {
            RetryKind::Exponential => {
                (Backoff::Exponential { multiplier: DEFAULT_BACKOFF_MULTIPLIER }, true)
            }
            RetryKind::Linear => (Backoff::Linear, false),
            RetryKind::Fixed => (Backoff::Fixed, false),
        };

        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            backoff,
            max_delay: Some(DEFAULT_MAX_DELAY),
            jitter,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            retryable_errors: None,
            retry_condition: None,
            timeout: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff.multiplier()
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    pub fn retryable_errors(&self) -> Option<&HashSet<ErrorKind>> {
        self.retryable_errors.as_ref()
    }

    pub fn retry_condition(&self) -> Option<&RetryCondition> {
        self.retry_condition.as_ref()
    }

    /// Per-attempt wall-clock budget
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Capped delay after the 1-indexed `attempt` failed, without jitter
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(self.base_delay, attempt);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Delay actually slept after the 1-indexed `attempt` failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.base_delay_for_attempt(attempt))
    }

    /// Scale `delay` by a uniform factor in `[1 − f, 1 + f]`
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = self.jitter_factor;
        let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        Duration::try_from_secs_f64(delay.as_secs_f64() * scale).unwrap_or(delay)
    }

    /// Whether `error` may be retried under this strategy
    ///
    /// Both filters must pass when both are set; with neither set every
    /// failure is retryable.
    pub fn is_retryable<E>(&self, error: &RecoveryError<E>) -> bool
    where
        E: std::error::Error + Classify + 'static,
    {
        if matches!(error, RecoveryError::Cancelled | RecoveryError::Configuration(_)) {
            return false;
        }

        let kind_allowed =
            self.retryable_errors.as_ref().map_or(true, |kinds| kinds.contains(&error.kind()));
        let condition_allowed =
            self.retry_condition.as_ref().map_or(true, |c| c.matches(error.as_dyn_error()));

        kind_allowed && condition_allowed
    }

    /// Validate invariants
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }

        if let Backoff::Exponential { multiplier } = self.backoff {
            if !multiplier.is_finite() || multiplier <= 0.0 {
                return Err(ConfigError::invalid(format!(
                    "backoff multiplier must be greater than 0, got {multiplier}"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }

        Ok(())
    }
}

/// Fluent builder for [`RetryStrategy`]
#[derive(Debug)]
pub struct RetryStrategyBuilder {
    strategy: RetryStrategy,
}

impl Default for RetryStrategyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategyBuilder {
    pub fn new() -> Self {
        Self { strategy: RetryStrategy::default() }
    }

    /// Start from the preset for `kind`
    pub fn from_preset(kind: RetryKind) -> Self {
        Self { strategy: RetryStrategy::preset(kind) }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.strategy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.strategy.base_delay = delay;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.strategy.backoff = backoff;
        self
    }

    /// Exponential growth with the given multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.strategy.backoff = Backoff::Exponential { multiplier };
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.strategy.max_delay = Some(delay);
        self
    }

    pub fn unbounded_delay(mut self) -> Self {
        self.strategy.max_delay = None;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.strategy.jitter = enabled;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.strategy.jitter_factor = factor;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(false)
    }

    /// Only retry failures of these kinds
    pub fn retryable_errors<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = ErrorKind>,
    {
        self.strategy.retryable_errors = Some(kinds.into_iter().collect());
        self
    }

    pub fn retry_condition(mut self, condition: RetryCondition) -> Self {
        self.strategy.retry_condition = Some(condition);
        self
    }

    /// Per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.strategy.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ConfigResult<RetryStrategy> {
        self.strategy.validate()?;
        Ok(self.strategy)
    }
}

/// Overrides applied on top of a preset by [`create_retry_strategy`]
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    /// Only honoured by the exponential preset
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub jitter_factor: Option<f64>,
    pub retryable_errors: Option<HashSet<ErrorKind>>,
    pub retry_condition: Option<RetryCondition>,
    pub timeout: Option<Duration>,
}

/// Build a strategy from a preset and caller overrides
pub fn create_retry_strategy(kind: RetryKind, options: RetryOptions) -> ConfigResult<RetryStrategy> {
    let mut strategy = RetryStrategy::preset(kind);

    if let Some(attempts) = options.max_attempts {
        strategy.max_attempts = attempts;
    }
    if let Some(delay) = options.base_delay {
        strategy.base_delay = delay;
    }
    if let Some(delay) = options.max_delay {
        strategy.max_delay = Some(delay);
    }
    if let (RetryKind::Exponential, Some(multiplier)) = (kind, options.backoff_multiplier) {
        strategy.backoff = Backoff::Exponential { multiplier };
    }
    if let Some(jitter) = options.jitter {
        strategy.jitter = jitter;
    }
    if let Some(factor) = options.jitter_factor {
        strategy.jitter_factor = factor;
    }
    if options.retryable_errors.is_some() {
        strategy.retryable_errors = options.retryable_errors;
    }
    if options.retry_condition.is_some() {
        strategy.retry_condition = options.retry_condition;
    }
    if options.timeout.is_some() {
        strategy.timeout = options.timeout;
    }

    strategy.validate()?;
    Ok(strategy)
}

/// Per-call context for the retry loop
///
/// Statistics are only recorded when an operation id is present. Cancelling
/// the token interrupts the inter-attempt delay.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    operation_id: Option<String>,
    cancellation: CancellationToken,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose attempts are recorded under `operation_id`
    pub fn for_operation<S: Into<String>>(operation_id: S) -> Self {
        Self { operation_id: Some(operation_id.into()), cancellation: CancellationToken::new() }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Sleep for `delay` unless `token` fires first; returns `false` when cancelled
pub(crate) async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommonError;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_exponential_delay_formula() {
        let strategy = RetryStrategy::builder()
            .base_delay(ms(100))
            .backoff_multiplier(2.0)
            .max_delay(ms(10_000))
            .no_jitter()
            .build()
            .expect("valid strategy");

        assert_eq!(strategy.base_delay_for_attempt(1), ms(100));
        assert_eq!(strategy.base_delay_for_attempt(2), ms(200));
        assert_eq!(strategy.base_delay_for_attempt(3), ms(400));
        assert_eq!(strategy.base_delay_for_attempt(4), ms(800));
        assert_eq!(strategy.base_delay_for_attempt(40), ms(10_000), "delay should be capped");
    }

    #[test]
    fn test_unbounded_delay_saturates() {
        let strategy = RetryStrategy::builder()
            .base_delay(Duration::from_secs(3600))
            .backoff_multiplier(10.0)
            .unbounded_delay()
            .no_jitter()
            .build()
            .expect("valid strategy");

        assert_eq!(strategy.base_delay_for_attempt(60), Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = create_retry_strategy(
            RetryKind::Linear,
            RetryOptions { base_delay: Some(ms(50)), ..RetryOptions::default() },
        )
        .expect("valid linear strategy");
        assert_eq!(linear.base_delay_for_attempt(1), ms(50));
        assert_eq!(linear.base_delay_for_attempt(2), ms(100));
        assert_eq!(linear.base_delay_for_attempt(3), ms(150));

        let fixed = create_retry_strategy(
            RetryKind::Fixed,
            RetryOptions { base_delay: Some(ms(75)), ..RetryOptions::default() },
        )
        .expect("valid fixed strategy");
        assert_eq!(fixed.base_delay_for_attempt(1), ms(75));
        assert_eq!(fixed.base_delay_for_attempt(9), ms(75));
        assert_eq!(fixed.backoff_multiplier(), 1.0);
    }

    #[test]
    fn test_presets() {
        let exponential = RetryStrategy::preset(RetryKind::Exponential);
        assert_eq!(exponential.backoff_multiplier(), 2.0);
        assert!(exponential.jitter());

        let linear = RetryStrategy::preset(RetryKind::Linear);
        assert_eq!(linear.backoff(), Backoff::Linear);
        assert!(!linear.jitter());

        let fixed = RetryStrategy::preset(RetryKind::Fixed);
        assert_eq!(fixed.backoff(), Backoff::Fixed);
        assert!(!fixed.jitter());
        assert_eq!(fixed.max_attempts(), DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_options_override_preset() {
        let strategy = create_retry_strategy(
            RetryKind::Exponential,
            RetryOptions {
                max_attempts: Some(7),
                base_delay: Some(ms(20)),
                max_delay: Some(ms(500)),
                backoff_multiplier: Some(3.0),
                retryable_errors: Some([ErrorKind::Network].into_iter().collect()),
                ..RetryOptions::default()
            },
        )
        .expect("valid strategy");

        assert_eq!(strategy.max_attempts(), 7);
        assert_eq!(strategy.base_delay(), ms(20));
        assert_eq!(strategy.max_delay(), Some(ms(500)));
        assert_eq!(strategy.backoff_multiplier(), 3.0);
        assert!(strategy.retryable_errors().is_some_and(|k| k.contains(&ErrorKind::Network)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let strategy = RetryStrategy::builder()
            .base_delay(ms(1000))
            .backoff(Backoff::Fixed)
            .jitter(true)
            .jitter_factor(0.25)
            .build()
            .expect("valid strategy");

        for _ in 0..200 {
            let delay = strategy.delay_for_attempt(1);
            assert!(delay >= ms(750), "jittered delay {delay:?} below lower bound");
            assert!(delay <= ms(1250), "jittered delay {delay:?} above upper bound");
        }
    }

    #[test]
    fn test_zero_jitter_factor_is_deterministic() {
        let strategy = RetryStrategy::builder()
            .base_delay(ms(40))
            .backoff(Backoff::Fixed)
            .jitter(true)
            .jitter_factor(0.0)
            .build()
            .expect("valid strategy");

        assert_eq!(strategy.delay_for_attempt(3), ms(40));
    }

    #[test]
    fn test_validation() {
        assert!(RetryStrategy::builder().max_attempts(0).build().is_err());
        assert!(RetryStrategy::builder().backoff_multiplier(0.0).build().is_err());
        assert!(RetryStrategy::builder().jitter_factor(1.5).build().is_err());
        assert!(RetryStrategy::builder().max_attempts(1).build().is_ok());
        assert!(RetryStrategy::builder().max_attempts(1_000).build().is_ok());
    }

    /// Validates the exponential formula well past 31 attempts.
    ///
    /// Assertions:
    /// - Attempt 40 with multiplier 1.5 is `1ms × 1.5^39`, not a truncated
    ///   exponent.
    /// - A multiplier barely above 1 keeps growing at attempt 64.
    #[test]
    fn test_exponential_delay_for_high_attempts() {
        let strategy = RetryStrategy::builder()
            .base_delay(ms(1))
            .backoff_multiplier(1.5)
            .unbounded_delay()
            .no_jitter()
            .build()
            .expect("valid strategy");

        let expected = 1e-3 * 1.5_f64.powi(39);
        let actual = strategy.base_delay_for_attempt(40).as_secs_f64();
        assert!((actual - expected).abs() < 1e-3, "expected {expected}s, got {actual}s");

        let gentle = Backoff::Exponential { multiplier: 1.01 };
        let at_32 = gentle.delay(Duration::from_secs(1), 32);
        let at_64 = gentle.delay(Duration::from_secs(1), 64);
        assert!(at_64 > at_32, "delay must keep growing: {at_32:?} vs {at_64:?}");
        assert!((at_64.as_secs_f64() - 1.01_f64.powi(63)).abs() < 1e-6);
    }

    #[test]
    fn test_retryability_by_kind() {
        let strategy = RetryStrategy::builder()
            .retryable_errors([ErrorKind::Network, ErrorKind::Timeout])
            .build()
            .expect("valid strategy");

        let network = RecoveryError::Operation(CommonError::backend("api", "reset", true));
        let auth = RecoveryError::Operation(CommonError::unauthorized("GET /"));

        assert!(strategy.is_retryable(&network));
        assert!(!strategy.is_retryable(&auth));
    }

    #[test]
    fn test_retryability_with_condition_and_kinds() {
        let condition = RetryCondition::new(|error| {
            error
                .downcast_ref::<CommonError>()
                .is_some_and(|e| !e.to_string().contains("permanent"))
        });
        let strategy = RetryStrategy::builder()
            .retryable_errors([ErrorKind::Network])
            .retry_condition(condition)
            .build()
            .expect("valid strategy");

        let transient = RecoveryError::Operation(CommonError::backend("api", "reset", true));
        let permanent = RecoveryError::Operation(CommonError::backend("api", "permanent", true));
        let wrong_kind = RecoveryError::Operation(CommonError::rate_limit());

        assert!(strategy.is_retryable(&transient));
        assert!(!strategy.is_retryable(&permanent), "condition must also hold");
        assert!(!strategy.is_retryable(&wrong_kind), "kind must also match");
    }

    #[test]
    fn test_everything_retryable_without_filters() {
        let strategy = RetryStrategy::default();
        let err = RecoveryError::Operation(CommonError::validation("body", "invalid json"));
        assert!(strategy.is_retryable(&err));

        let cancelled: RecoveryError<CommonError> = RecoveryError::Cancelled;
        assert!(!strategy.is_retryable(&cancelled));
    }

    #[test]
    fn test_retry_kind_parsing() {
        assert_eq!("Exponential".parse::<RetryKind>(), Ok(RetryKind::Exponential));
        assert_eq!(" fixed ".parse::<RetryKind>(), Ok(RetryKind::Fixed));
        assert!(matches!(
            "fibonacci".parse::<RetryKind>(),
            Err(ConfigError::UnknownStrategy { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(ms(10), &token).await);

        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &token).await);
    }
}
