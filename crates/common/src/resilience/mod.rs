//! Resilience & recovery engine
//!
//! Wraps arbitrary async operations with bounded retry, per-service circuit
//! breaking, composite recovery policies and statistics/health aggregation.
//! Every network-facing call in the toolkit (request execution, batch items)
//! is expected to go through a [`RecoveryEngine`] instead of handling
//! failures itself.
//!
//! - **Retry**: [`RetryStrategy`] presets (`exponential`, `linear`, `fixed`),
//!   backoff with jitter, kind- and predicate-based retryability
//! - **Circuit Breaker**: closed / open / half-open per service key with a
//!   single half-open trial
//! - **Recovery Policy**: retry + breaker + per-kind overrides + fallback
//! - **Stats & Health**: per-key [`RecoveryStats`] and an engine-wide
//!   [`HealthReport`]
//!
//! The engine performs no I/O and keeps all state in memory, keyed by the
//! caller's service or operation identifier.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apiforge_common::resilience::{
//!     create_retry_strategy, ErrorKind, RecoveryEngine, RetryContext, RetryKind, RetryOptions,
//! };
//!
//! let engine = RecoveryEngine::new();
//! let strategy = create_retry_strategy(
//!     RetryKind::Exponential,
//!     RetryOptions {
//!         retryable_errors: Some([ErrorKind::Network, ErrorKind::Timeout].into()),
//!         ..RetryOptions::default()
//!     },
//! )?;
//!
//! let body = engine
//!     .execute_with_retry(|| client.get(url), &strategy, &RetryContext::for_operation("users"))
//!     .await?;
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod constants;
pub mod engine;
pub mod error;
pub mod policy;
pub mod retry;
pub mod settings;
pub mod stats;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerSnapshot, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use engine::RecoveryEngine;
pub use error::{
    Classify, ConfigError, ConfigResult, ErrorKind, RecoveryError, RecoveryResult, TimeoutScope,
};
pub use policy::{
    create_recovery_policy, fallback_fn, Fallback, FallbackCache, FallbackFn, FallbackKind,
    MemoryFallbackCache, RecoveryPolicy, RecoveryPolicyOptions, StrategySpec,
};
pub use retry::{
    create_retry_strategy, Backoff, RetryCondition, RetryContext, RetryKind, RetryOptions,
    RetryStrategy, RetryStrategyBuilder,
};
pub use settings::{
    apply_preset, parse_settings, CircuitBreakerSettings, HealthSettings, PolicyPreset,
    ResilienceSettings, RetrySettings,
};
pub use stats::{HealthReport, RecoveryStats, ServiceHealth};
