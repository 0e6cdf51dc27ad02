//! Error kinds and the engine's failure type
//!
//! Retry filters and per-kind error policies dispatch on an [`ErrorKind`]
//! obtained through the [`Classify`] trait instead of on type names. Every
//! failure the engine surfaces is a [`RecoveryError`], whose `Operation`
//! variant carries the caller's own error untouched.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::error::{CommonError, ErrorClassification, ErrorSeverity};

/// Category of a failure, used for retry filtering and error policies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure and the like
    Network,
    /// An attempt or policy budget was exceeded
    Timeout,
    /// The upstream throttled the caller
    RateLimit,
    /// The upstream failed on its side
    Server,
    /// The request itself was rejected
    Client,
    /// Credentials missing or refused
    Authentication,
    /// The target resource does not exist
    NotFound,
    /// A circuit breaker rejected the call
    CircuitOpen,
    /// Invalid engine or policy configuration
    Configuration,
    /// The caller cancelled the operation
    Cancelled,
    /// Could not be classified
    Unknown,
    /// Caller-defined category
    Custom(String),
}

impl ErrorKind {
    /// Stable snake_case label
    pub fn as_str(&self) -> &str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Client => "client",
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::CircuitOpen => "circuit_open",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::Custom(name) => name,
        }
    }

    /// Whether failures of this kind are usually transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Server | Self::CircuitOpen
        )
    }

    /// Severity used when logging terminal failures of this kind
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotFound | Self::Cancelled => ErrorSeverity::Info,
            Self::Timeout | Self::RateLimit | Self::CircuitOpen => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = Infallible;

    /// Accepts labels (`rate_limit`) as well as type-style names
    /// (`RateLimitError`); anything else becomes [`ErrorKind::Custom`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String =
            s.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_ascii_lowercase();
        let normalized = normalized.strip_suffix("error").unwrap_or(&normalized);

        Ok(match normalized {
            "network" => Self::Network,
            "timeout" => Self::Timeout,
            "ratelimit" => Self::RateLimit,
            "server" => Self::Server,
            "client" => Self::Client,
            "auth" | "authentication" => Self::Authentication,
            "notfound" => Self::NotFound,
            "circuitopen" | "circuitbreakeropen" => Self::CircuitOpen,
            "config" | "configuration" => Self::Configuration,
            "cancelled" | "canceled" => Self::Cancelled,
            "unknown" => Self::Unknown,
            _ => Self::Custom(s.to_string()),
        })
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        match label.parse::<Self>() {
            Ok(kind) => Ok(kind),
            Err(never) => match never {},
        }
    }
}

/// Explicit classification of an error into an [`ErrorKind`]
pub trait Classify {
    /// The kind this error belongs to
    fn kind(&self) -> ErrorKind;
}

impl Classify for CommonError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Configuration,
            Self::CircuitBreakerOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Backend { is_retryable: true, .. } => ErrorKind::Network,
            Self::Backend { is_retryable: false, .. } => ErrorKind::Server,
            Self::Validation { .. } | Self::Serialization { .. } => ErrorKind::Client,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Authentication,
            Self::Internal { .. } => ErrorKind::Unknown,
        }
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match std::io::Error::kind(self) {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::AddrNotAvailable
            | Io::BrokenPipe
            | Io::UnexpectedEof => ErrorKind::Network,
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Authentication,
            Io::InvalidInput | Io::InvalidData => ErrorKind::Client,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Which budget a timeout failure exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutScope {
    /// A single attempt (`RetryStrategy::timeout`)
    Attempt,
    /// All attempts of a recovery policy (`RecoveryPolicy::timeout`)
    Policy,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempt => write!(f, "Attempt"),
            Self::Policy => write!(f, "Recovery policy"),
        }
    }
}

/// Invalid engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Fallback strategy '{strategy}' is missing its payload")]
    MissingFallback { strategy: String },

    #[error("Unknown preset '{name}'")]
    UnknownPreset { name: String },

    #[error("Unknown retry strategy '{name}'")]
    UnknownStrategy { name: String },

    #[error("Failed to load resilience settings: {message}")]
    Load { message: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result of configuration and policy construction
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failure surfaced by the recovery engine
#[derive(Debug, Error)]
pub enum RecoveryError<E> {
    /// The caller's operation failed; the original error is preserved
    #[error(transparent)]
    Operation(E),

    /// An attempt or the whole policy ran out of time
    #[error("{scope} timed out after {budget:?}")]
    Timeout { scope: TimeoutScope, budget: Duration },

    /// Rejected by an open circuit breaker; the operation did not run
    #[error("Circuit breaker is open for '{service}'")]
    CircuitOpen { service: String, retry_after: Option<Duration> },

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The supplied configuration was rejected
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Result type of engine operations
pub type RecoveryResult<T, E> = Result<T, RecoveryError<E>>;

impl<E> RecoveryError<E> {
    /// Borrow the caller's original error, if this is an operation failure
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Take the caller's original error, if this is an operation failure
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the call was rejected by an open breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether an attempt or policy budget was exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl<E> RecoveryError<E>
where
    E: std::error::Error + 'static,
{
    /// The error handed to retry predicates: the caller's own error for
    /// operation failures, otherwise the engine error itself.
    pub fn as_dyn_error(&self) -> &(dyn std::error::Error + 'static) {
        match self {
            Self::Operation(error) => error,
            other => other,
        }
    }
}

impl<E: Classify> Classify for RecoveryError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Operation(error) => error.kind(),
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

impl<E: Classify> ErrorClassification for RecoveryError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::Configuration(_) => false,
            other => other.kind().is_transient(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        self.kind().severity()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
