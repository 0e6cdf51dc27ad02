// Defaults shared by the retry, circuit breaker and health components
use std::time::Duration;

/// Default number of attempts (first call included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default cap on a computed retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default multiplier for exponential backoff
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 = no jitter, 1.0 = delay may double or vanish)
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Circuit breaker: consecutive failures before opening
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker: cooldown before a half-open trial
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Health: number of recent outcomes kept per service
pub const DEFAULT_HEALTH_WINDOW: usize = 20;

/// Health: failure rate above which a breaker-less service is unhealthy
pub const DEFAULT_UNHEALTHY_FAILURE_RATE: f64 = 0.5;

/// Fallback cache: default entry lifetime
pub const DEFAULT_FALLBACK_CACHE_TTL: Duration = Duration::from_secs(300);

/// Fallback cache: default capacity
pub const DEFAULT_FALLBACK_CACHE_CAPACITY: u64 = 1000;
