//! Shared resilience layer for the ApiForge toolkit.
//!
//! Request execution, batch processing and workflow steps wrap their
//! network-facing work in a [`RecoveryEngine`] to get bounded retry,
//! per-service circuit breaking, fallbacks and health reporting.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: errors and serde helpers
//! - `observability`: tracing instrumentation
//! - `runtime`: the recovery engine and its async machinery (default)
//! - `test-utils`: scripted operations, assertions and tracing setup for
//!   downstream tests

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    apply_preset, create_recovery_policy, create_retry_strategy, CircuitBreakerConfig,
    CircuitState, Classify, Clock, ErrorKind, Fallback, HealthReport, MockClock, PolicyPreset,
    RecoveryEngine, RecoveryError, RecoveryPolicy, RecoveryPolicyOptions, RecoveryResult,
    RecoveryStats, ResilienceSettings, RetryContext, RetryKind, RetryOptions, RetryStrategy,
    SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::serde::{duration_millis, option_duration_millis};
