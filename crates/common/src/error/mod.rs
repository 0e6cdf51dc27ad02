//! Common error types shared across the API toolkit
//!
//! Request execution, batch runs and importers all fail in a handful of
//! recurring ways (a backend is unreachable, a rate limit kicked in, a
//! deadline passed, the configuration is wrong). [`CommonError`] names those
//! patterns once so every module reports them the same way, and
//! [`ErrorClassification`] gives callers a uniform view of retryability and
//! severity.
//!
//! Module-specific errors should compose with `CommonError` rather than
//! duplicate its variants:
//!
//! ```rust,ignore
//! #[derive(Debug, thiserror::Error)]
//! pub enum ImportError {
//!     #[error("Unsupported collection version: {0}")]
//!     UnsupportedVersion(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//! ```
//!
//! ## Severity levels
//!
//! | Level | Use Case |
//! |-------|----------|
//! | **Info** | Expected conditions (resource not found) |
//! | **Warning** | Degraded but operational (rate limiting, open circuit, timeouts) |
//! | **Error** | Failure requiring attention (backend errors, invalid config) |
//! | **Critical** | Invariant violations |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Standard result type using [`CommonError`]
pub type CommonResult<T> = Result<T, CommonError>;

/// Error variants that recur across the toolkit
#[derive(Debug, Clone, Error)]
pub enum CommonError {
    /// Invalid or missing configuration
    #[error("Configuration error: {message}")]
    Config { message: String, field: Option<String> },

    /// A circuit breaker rejected the call
    #[error("Circuit breaker open for '{service}'")]
    CircuitBreakerOpen { service: String, retry_after: Option<Duration> },

    /// The upstream signalled throttling
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// An operation ran past its deadline
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// Network or upstream failure
    #[error("Backend error from '{service}': {message}")]
    Backend { service: String, message: String, is_retryable: bool },

    /// Input rejected before sending
    #[error("Validation error for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Missing resource
    #[error("{resource_type} not found")]
    NotFound { resource_type: String, identifier: Option<String> },

    /// Credentials missing or rejected
    #[error("Unauthorized to perform '{operation}'")]
    Unauthorized { operation: String },

    /// Encoding or decoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String, format: Option<String> },

    /// Bugs and invariant violations
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Severity used for monitoring and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Uniform classification of errors across modules
pub trait ErrorClassification {
    /// Whether repeating the operation may succeed
    fn is_retryable(&self) -> bool;

    /// How serious the error is
    fn severity(&self) -> ErrorSeverity;

    /// Whether the error needs immediate attention
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Suggested delay before the next attempt, if the error carries one
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. } | Self::RateLimitExceeded { .. } => true,
            Self::Timeout { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotFound { .. } => ErrorSeverity::Info,
            Self::CircuitBreakerOpen { .. }
            | Self::RateLimitExceeded { .. }
            | Self::Timeout { .. }
            | Self::Unauthorized { .. } => ErrorSeverity::Warning,
            Self::Config { .. }
            | Self::Backend { .. }
            | Self::Validation { .. }
            | Self::Serialization { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. }
            | Self::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl CommonError {
    /// Configuration error without a field
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Configuration error for a specific field
    pub fn config_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Circuit breaker rejection
    pub fn circuit_breaker<S: Into<String>>(service: S) -> Self {
        Self::CircuitBreakerOpen { service: service.into(), retry_after: None }
    }

    /// Rate limit without a retry hint
    pub fn rate_limit() -> Self {
        Self::RateLimitExceeded { retry_after: None }
    }

    /// Rate limit carrying the upstream's retry hint
    pub fn rate_limit_after(retry_after: Duration) -> Self {
        Self::RateLimitExceeded { retry_after: Some(retry_after) }
    }

    /// Deadline exceeded
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Upstream or network failure
    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    /// Input validation failure
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Missing resource
    pub fn not_found<T: Into<String>>(resource_type: T) -> Self {
        Self::NotFound { resource_type: resource_type.into(), identifier: None }
    }

    /// Authorization failure
    pub fn unauthorized<O: Into<String>>(operation: O) -> Self {
        Self::Unauthorized { operation: operation.into() }
    }

    /// Serialization failure tagged with its format
    pub fn serialization_format<F: Into<String>, S: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }
}
