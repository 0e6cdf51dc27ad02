//! Composite recovery policies
//!
//! A [`RecoveryPolicy`] bundles a default retry strategy, an optional
//! circuit breaker configuration, per-kind retry overrides, a whole-call
//! timeout and a fallback. Policies are built with [`create_recovery_policy`],
//! which resolves named strategies and rejects fallbacks without a payload.
//!
//! ```rust,ignore
//! let options = RecoveryPolicyOptions::new("exponential")
//!     .with_error_policy(ErrorKind::RateLimit, RetryStrategy::preset(RetryKind::Fixed))
//!     .with_fallback_function(fallback_fn(|| async { Ok(cached_response()) }));
//! let policy = create_recovery_policy(options)?;
//! let response = engine.execute_with_policy(|| send(&request), "users-api", &policy).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreakerConfig;
use super::constants::{DEFAULT_FALLBACK_CACHE_CAPACITY, DEFAULT_FALLBACK_CACHE_TTL};
use super::error::{ConfigError, ConfigResult, ErrorKind};
use super::retry::{RetryKind, RetryStrategy};

/// Substitute-result producer used by the `function` and `endpoint` fallbacks
pub type FallbackFn<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Wrap an async closure as a [`FallbackFn`]
pub fn fallback_fn<T, E, F, Fut>(f: F) -> FallbackFn<T, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Store consulted by the `cache` fallback
///
/// The engine writes every successful primary result under the service key
/// and reads it back when the primary path fails terminally.
#[async_trait]
pub trait FallbackCache<T>: Send + Sync {
    async fn get(&self, key: &str) -> Option<T>;

    async fn put(&self, key: &str, value: T);
}

/// In-memory [`FallbackCache`] with TTL and bounded capacity
#[derive(Clone)]
pub struct MemoryFallbackCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Cache<String, T>,
}

impl<T> MemoryFallbackCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_FALLBACK_CACHE_TTL, DEFAULT_FALLBACK_CACHE_CAPACITY)
    }

    pub fn with_settings(ttl: Duration, max_capacity: u64) -> Self {
        let inner = Cache::builder().max_capacity(max_capacity).time_to_live(ttl).build();
        Self { inner }
    }

    /// Approximate number of cached entries
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

impl<T> Default for MemoryFallbackCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MemoryFallbackCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFallbackCache").field("entries", &self.inner.entry_count()).finish()
    }
}

#[async_trait]
impl<T> FallbackCache<T> for MemoryFallbackCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: T) {
        self.inner.insert(key.to_string(), value).await;
    }
}

/// Which fallback a policy applies after a terminal failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    #[default]
    None,
    Function,
    Cache,
    Endpoint,
}

impl FallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Function => "function",
            Self::Cache => "cache",
            Self::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "function" => Ok(Self::Function),
            "cache" => Ok(Self::Cache),
            "endpoint" => Ok(Self::Endpoint),
            other => Err(ConfigError::invalid(format!("unknown fallback strategy '{other}'"))),
        }
    }
}

/// Resolved fallback with its payload
pub enum Fallback<T, E> {
    None,
    Function(FallbackFn<T, E>),
    Cache(Arc<dyn FallbackCache<T>>),
    /// Alternate operation, typically the same call against another endpoint
    Endpoint(FallbackFn<T, E>),
}

impl<T, E> Fallback<T, E> {
    pub fn kind(&self) -> FallbackKind {
        match self {
            Self::None => FallbackKind::None,
            Self::Function(_) => FallbackKind::Function,
            Self::Cache(_) => FallbackKind::Cache,
            Self::Endpoint(_) => FallbackKind::Endpoint,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl<T, E> Clone for Fallback<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Function(f) => Self::Function(Arc::clone(f)),
            Self::Cache(cache) => Self::Cache(Arc::clone(cache)),
            Self::Endpoint(f) => Self::Endpoint(Arc::clone(f)),
        }
    }
}

impl<T, E> fmt::Debug for Fallback<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fallback({})", self.kind())
    }
}

/// Default retry strategy of a policy, by preset name or explicit value
#[derive(Debug, Clone)]
pub enum StrategySpec {
    /// `"exponential"`, `"linear"` or `"fixed"`
    Named(String),
    Custom(RetryStrategy),
}

impl StrategySpec {
    fn resolve(self) -> ConfigResult<RetryStrategy> {
        match self {
            Self::Named(name) => Ok(RetryStrategy::preset(name.parse::<RetryKind>()?)),
            Self::Custom(strategy) => {
                strategy.validate()?;
                Ok(strategy)
            }
        }
    }
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self::Custom(RetryStrategy::default())
    }
}

impl From<&str> for StrategySpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for StrategySpec {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<RetryKind> for StrategySpec {
    fn from(kind: RetryKind) -> Self {
        Self::Custom(RetryStrategy::preset(kind))
    }
}

impl From<RetryStrategy> for StrategySpec {
    fn from(strategy: RetryStrategy) -> Self {
        Self::Custom(strategy)
    }
}

/// Unvalidated input to [`create_recovery_policy`]
pub struct RecoveryPolicyOptions<T, E> {
    pub retry_strategy: StrategySpec,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub fallback_strategy: FallbackKind,
    pub fallback_function: Option<FallbackFn<T, E>>,
    pub fallback_endpoint: Option<FallbackFn<T, E>>,
    pub cache_strategy: Option<Arc<dyn FallbackCache<T>>>,
    /// Retry overrides keyed by failure kind
    pub error_policies: HashMap<ErrorKind, RetryStrategy>,
    /// Budget spanning all attempts and delays
    pub timeout: Option<Duration>,
}

impl<T, E> Default for RecoveryPolicyOptions<T, E> {
    fn default() -> Self {
        Self {
            retry_strategy: StrategySpec::default(),
            circuit_breaker: None,
            fallback_strategy: FallbackKind::None,
            fallback_function: None,
            fallback_endpoint: None,
            cache_strategy: None,
            error_policies: HashMap::new(),
            timeout: None,
        }
    }
}

impl<T, E> fmt::Debug for RecoveryPolicyOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPolicyOptions")
            .field("retry_strategy", &self.retry_strategy)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("fallback_strategy", &self.fallback_strategy)
            .field("has_fallback_function", &self.fallback_function.is_some())
            .field("has_fallback_endpoint", &self.fallback_endpoint.is_some())
            .field("has_cache_strategy", &self.cache_strategy.is_some())
            .field("error_policies", &self.error_policies)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T, E> RecoveryPolicyOptions<T, E> {
    pub fn new<S: Into<StrategySpec>>(retry_strategy: S) -> Self {
        Self { retry_strategy: retry_strategy.into(), ..Self::default() }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_error_policy(mut self, kind: ErrorKind, strategy: RetryStrategy) -> Self {
        self.error_policies.insert(kind, strategy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Select the `function` fallback with its payload
    pub fn with_fallback_function(mut self, f: FallbackFn<T, E>) -> Self {
        self.fallback_strategy = FallbackKind::Function;
        self.fallback_function = Some(f);
        self
    }

    /// Select the `endpoint` fallback with its payload
    pub fn with_fallback_endpoint(mut self, f: FallbackFn<T, E>) -> Self {
        self.fallback_strategy = FallbackKind::Endpoint;
        self.fallback_endpoint = Some(f);
        self
    }

    /// Select the `cache` fallback with its store
    pub fn with_fallback_cache(mut self, cache: Arc<dyn FallbackCache<T>>) -> Self {
        self.fallback_strategy = FallbackKind::Cache;
        self.cache_strategy = Some(cache);
        self
    }
}

/// Validated, executable recovery policy
pub struct RecoveryPolicy<T, E> {
    retry_strategy: RetryStrategy,
    circuit_breaker: Option<CircuitBreakerConfig>,
    fallback: Fallback<T, E>,
    error_policies: HashMap<ErrorKind, RetryStrategy>,
    timeout: Option<Duration>,
}

impl<T, E> Clone for RecoveryPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            retry_strategy: self.retry_strategy.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            fallback: self.fallback.clone(),
            error_policies: self.error_policies.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T, E> fmt::Debug for RecoveryPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("retry_strategy", &self.retry_strategy)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("fallback", &self.fallback)
            .field("error_policies", &self.error_policies)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T, E> RecoveryPolicy<T, E> {
    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker.as_ref()
    }

    pub fn fallback(&self) -> &Fallback<T, E> {
        &self.fallback
    }

    pub fn error_policies(&self) -> &HashMap<ErrorKind, RetryStrategy> {
        &self.error_policies
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Override strategy registered for `kind`, if any
    pub fn override_for(&self, kind: &ErrorKind) -> Option<&RetryStrategy> {
        self.error_policies.get(kind)
    }

    /// Strategy governing failures of `kind`
    pub fn strategy_for(&self, kind: &ErrorKind) -> &RetryStrategy {
        self.override_for(kind).unwrap_or(&self.retry_strategy)
    }
}

/// Validate options and build a policy
///
/// Fails with [`ConfigError::UnknownStrategy`] for an unknown preset name and
/// [`ConfigError::MissingFallback`] when the chosen fallback has no payload.
pub fn create_recovery_policy<T, E>(
    options: RecoveryPolicyOptions<T, E>,
) -> ConfigResult<RecoveryPolicy<T, E>> {
    let RecoveryPolicyOptions {
        retry_strategy,
        circuit_breaker,
        fallback_strategy,
        fallback_function,
        fallback_endpoint,
        cache_strategy,
        error_policies,
        timeout,
    } = options;

    let retry_strategy = retry_strategy.resolve()?;

    if let Some(config) = &circuit_breaker {
        config.validate()?;
    }

    for (kind, strategy) in &error_policies {
        strategy.validate().map_err(|err| {
            ConfigError::invalid(format!("error policy for '{kind}' is invalid: {err}"))
        })?;
    }

    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(ConfigError::invalid("policy timeout must be greater than 0"));
    }

    let missing = || ConfigError::MissingFallback { strategy: fallback_strategy.to_string() };
    let fallback = match fallback_strategy {
        FallbackKind::None => Fallback::None,
        FallbackKind::Function => Fallback::Function(fallback_function.ok_or_else(missing)?),
        FallbackKind::Cache => Fallback::Cache(cache_strategy.ok_or_else(missing)?),
        FallbackKind::Endpoint => Fallback::Endpoint(fallback_endpoint.ok_or_else(missing)?),
    };

    Ok(RecoveryPolicy { retry_strategy, circuit_breaker, fallback, error_policies, timeout })
}
