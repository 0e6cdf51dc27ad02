//! Engine settings and named policy presets
//!
//! ## Loading Strategy
//! 1. Environment variables; any variable that is set overrides the default
//! 2. Otherwise the first settings file found (JSON or TOML, by extension)
//! 3. Otherwise built-in defaults
//!
//! ## Environment Variables
//! - `APIFORGE_RETRY_MAX_ATTEMPTS`: Attempts per operation, first call included
//! - `APIFORGE_RETRY_BASE_DELAY_MS`: Delay before the first retry
//! - `APIFORGE_RETRY_MAX_DELAY_MS`: Cap on computed delays
//! - `APIFORGE_BREAKER_FAILURE_THRESHOLD`: Consecutive failures that open a breaker
//! - `APIFORGE_BREAKER_RESET_TIMEOUT_MS`: Cooldown before a half-open trial
//! - `APIFORGE_HEALTH_FAILURE_RATE`: Recent failure rate marking a service unhealthy
//!
//! ## File Locations
//! `./apiforge.json`, `./apiforge.toml`, `./resilience.json`,
//! `./resilience.toml`, then the same names next to the executable.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreakerConfig;
use super::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HEALTH_WINDOW, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_RESET_TIMEOUT, DEFAULT_UNHEALTHY_FAILURE_RATE,
};
use super::error::{ConfigError, ConfigResult, ErrorKind};
use super::policy::{RecoveryPolicyOptions, StrategySpec};
use super::retry::{Backoff, RetryKind, RetryStrategy};
use crate::utils::{duration_millis, option_duration_millis};

const ENV_RETRY_MAX_ATTEMPTS: &str = "APIFORGE_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_BASE_DELAY_MS: &str = "APIFORGE_RETRY_BASE_DELAY_MS";
const ENV_RETRY_MAX_DELAY_MS: &str = "APIFORGE_RETRY_MAX_DELAY_MS";
const ENV_BREAKER_FAILURE_THRESHOLD: &str = "APIFORGE_BREAKER_FAILURE_THRESHOLD";
const ENV_BREAKER_RESET_TIMEOUT_MS: &str = "APIFORGE_BREAKER_RESET_TIMEOUT_MS";
const ENV_HEALTH_FAILURE_RATE: &str = "APIFORGE_HEALTH_FAILURE_RATE";

const SETTINGS_FILE_NAMES: [&str; 4] =
    ["apiforge.json", "apiforge.toml", "resilience.json", "resilience.toml"];

/// Default retry behaviour of an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: Some(DEFAULT_MAX_DELAY),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetrySettings {
    pub fn to_strategy(&self) -> ConfigResult<RetryStrategy> {
        let builder = RetryStrategy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.base_delay)
            .backoff(Backoff::Exponential { multiplier: self.backoff_multiplier })
            .jitter(self.jitter)
            .jitter_factor(self.jitter_factor);

        match self.max_delay {
            Some(max) => builder.max_delay(max).build(),
            None => builder.unbounded_delay().build(),
        }
    }
}

/// Default breaker configuration for keys that supply none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    #[serde(with = "option_duration_millis")]
    pub timeout_threshold: Option<Duration>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            timeout_threshold: None,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        let config = CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            timeout_threshold: self.timeout_threshold,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Health aggregation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Recent attempt outcomes kept per service
    pub window: usize,
    /// Breaker-less services above this recent failure rate are unhealthy
    pub unhealthy_failure_rate: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { window: DEFAULT_HEALTH_WINDOW, unhealthy_failure_rate: DEFAULT_UNHEALTHY_FAILURE_RATE }
    }
}

/// Complete engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub health: HealthSettings,
}

impl ResilienceSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.to_strategy()?;
        self.circuit_breaker.to_config()?;

        if !(0.0..=1.0).contains(&self.health.unhealthy_failure_rate) {
            return Err(ConfigError::invalid(format!(
                "unhealthy_failure_rate must be within [0, 1], got {}",
                self.health.unhealthy_failure_rate
            )));
        }
        if self.health.window == 0 {
            return Err(ConfigError::invalid("health window must be greater than 0"));
        }

        Ok(())
    }

    /// Load settings from the environment, then a settings file, then defaults
    ///
    /// # Errors
    /// Returns `ConfigError::Load` when a variable or file is present but
    /// malformed, or `ConfigError::Invalid` when the result fails validation.
    pub fn load() -> ConfigResult<Self> {
        if let Some(settings) = Self::from_env()? {
            tracing::info!("Resilience settings loaded from environment variables");
            return Ok(settings);
        }

        match find_settings_path() {
            Some(path) => Self::load_from_file(&path),
            None => {
                tracing::debug!("No resilience settings found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Settings from process environment variables; `None` when none are set
    pub fn from_env() -> ConfigResult<Option<Self>> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Settings from an arbitrary variable lookup
    pub fn from_env_with<F>(lookup: F) -> ConfigResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let mut found = false;

        if let Some(value) = env_parse::<u32, _>(&lookup, ENV_RETRY_MAX_ATTEMPTS)? {
            settings.retry.max_attempts = value;
            found = true;
        }
        if let Some(value) = env_parse::<u64, _>(&lookup, ENV_RETRY_BASE_DELAY_MS)? {
            settings.retry.base_delay = Duration::from_millis(value);
            found = true;
        }
        if let Some(value) = env_parse::<u64, _>(&lookup, ENV_RETRY_MAX_DELAY_MS)? {
            settings.retry.max_delay = Some(Duration::from_millis(value));
            found = true;
        }
        if let Some(value) = env_parse::<u32, _>(&lookup, ENV_BREAKER_FAILURE_THRESHOLD)? {
            settings.circuit_breaker.failure_threshold = value;
            found = true;
        }
        if let Some(value) = env_parse::<u64, _>(&lookup, ENV_BREAKER_RESET_TIMEOUT_MS)? {
            settings.circuit_breaker.reset_timeout = Duration::from_millis(value);
            found = true;
        }
        if let Some(value) = env_parse::<f64, _>(&lookup, ENV_HEALTH_FAILURE_RATE)? {
            settings.health.unhealthy_failure_rate = value;
            found = true;
        }

        if !found {
            return Ok(None);
        }
        settings.validate()?;
        Ok(Some(settings))
    }

    /// Load settings from `path`; the format follows the extension
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        tracing::info!(path = %path.display(), "Loading resilience settings from file");

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;

        parse_settings(&contents, path)
    }
}

/// Parse and validate settings text; `.toml` is TOML, anything else JSON
pub fn parse_settings(contents: &str, path: &Path) -> ConfigResult<ResilienceSettings> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    let settings: ResilienceSettings = match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| ConfigError::Load { message: format!("Invalid TOML format: {e}") })?,
        "json" => serde_json::from_str(contents)
            .map_err(|e| ConfigError::Load { message: format!("Invalid JSON format: {e}") })?,
        other => {
            return Err(ConfigError::Load { message: format!("Unsupported settings format: {other}") })
        }
    };

    settings.validate()?;
    Ok(settings)
}

/// First existing settings file in the standard locations
pub fn find_settings_path() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(SETTINGS_FILE_NAMES.iter().map(|name| cwd.join(name)));
    }

    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    {
        candidates.extend(SETTINGS_FILE_NAMES.iter().map(|name| exe_dir.join(name)));
    }

    candidates.into_iter().find(|path| path.is_file())
}

fn env_parse<T, F>(lookup: &F, name: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Load {
            message: format!("Invalid value for {name}: {e}"),
        }),
        None => Ok(None),
    }
}

/// Named tuning profiles for recovery policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPreset {
    /// Exponential retry, 3 attempts from 1s, breaker at 5 failures for 60s
    Default,
    /// Many quick retries and a tolerant breaker
    Aggressive,
    /// Few slow retries and a sensitive breaker
    Conservative,
    /// Default retries, but throttling retried on a slow fixed schedule
    RateLimited,
}

impl PolicyPreset {
    pub const ALL: [PolicyPreset; 4] =
        [Self::Default, Self::Aggressive, Self::Conservative, Self::RateLimited];

    /// Resolve a preset by name
    pub fn named(name: &str) -> ConfigResult<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(Self::Default),
            "aggressive" => Ok(Self::Aggressive),
            "conservative" => Ok(Self::Conservative),
            "rate_limited" | "ratelimited" => Ok(Self::RateLimited),
            _ => Err(ConfigError::UnknownPreset { name: name.to_string() }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Aggressive => "aggressive",
            Self::Conservative => "conservative",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn retry_strategy(&self) -> ConfigResult<RetryStrategy> {
        let builder = RetryStrategy::builder();
        match self {
            Self::Default | Self::RateLimited => builder.build(),
            Self::Aggressive => builder
                .max_attempts(5)
                .base_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(5))
                .build(),
            Self::Conservative => builder
                .max_attempts(2)
                .base_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(60))
                .build(),
        }
    }

    pub fn circuit_breaker(&self) -> ConfigResult<CircuitBreakerConfig> {
        let builder = CircuitBreakerConfig::builder();
        match self {
            Self::Default | Self::RateLimited => builder.build(),
            Self::Aggressive => {
                builder.failure_threshold(10).reset_timeout(Duration::from_secs(30)).build()
            }
            Self::Conservative => {
                builder.failure_threshold(3).reset_timeout(Duration::from_secs(120)).build()
            }
        }
    }

    pub fn error_policies(&self) -> ConfigResult<HashMap<ErrorKind, RetryStrategy>> {
        let mut policies = HashMap::new();
        if *self == Self::RateLimited {
            let throttled = RetryStrategy::builder()
                .backoff(Backoff::Fixed)
                .base_delay(Duration::from_secs(5))
                .max_attempts(5)
                .no_jitter()
                .build()?;
            policies.insert(ErrorKind::RateLimit, throttled);
        }
        Ok(policies)
    }

    /// Policy options for this preset, without a fallback
    pub fn options<T, E>(&self) -> ConfigResult<RecoveryPolicyOptions<T, E>> {
        Ok(RecoveryPolicyOptions {
            retry_strategy: StrategySpec::Custom(self.retry_strategy()?),
            circuit_breaker: Some(self.circuit_breaker()?),
            error_policies: self.error_policies()?,
            ..RecoveryPolicyOptions::default()
        })
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::named(s)
    }
}

/// Policy options for the preset called `name`
///
/// # Errors
/// `ConfigError::UnknownPreset` when no preset has that name.
pub fn apply_preset<T, E>(name: &str) -> ConfigResult<RecoveryPolicyOptions<T, E>> {
    let preset = PolicyPreset::named(name)?;
    tracing::debug!(preset = %preset, "Applying recovery policy preset");
    preset.options()
}

/// Strategy of `kind` using the limits from `settings`
pub fn strategy_for_kind(kind: RetryKind, settings: &RetrySettings) -> ConfigResult<RetryStrategy> {
    let mut builder = RetryStrategy::builder()
        .backoff(RetryStrategy::preset(kind).backoff())
        .max_attempts(settings.max_attempts)
        .base_delay(settings.base_delay)
        .jitter(kind == RetryKind::Exponential && settings.jitter)
        .jitter_factor(settings.jitter_factor);
    if kind == RetryKind::Exponential {
        builder = builder.backoff_multiplier(settings.backoff_multiplier);
    }
    match settings.max_delay {
        Some(max) => builder.max_delay(max).build(),
        None => builder.unbounded_delay().build(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::CommonError;
    use crate::resilience::policy::create_recovery_policy;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = ResilienceSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry.to_strategy().expect("strategy").max_attempts(), 3);
        assert_eq!(settings.circuit_breaker.to_config().expect("config").failure_threshold, 5);
    }

    #[test]
    fn test_env_overrides() {
        let settings = ResilienceSettings::from_env_with(lookup(&[
            (ENV_RETRY_MAX_ATTEMPTS, "6"),
            (ENV_BREAKER_RESET_TIMEOUT_MS, "2500"),
            (ENV_HEALTH_FAILURE_RATE, "0.25"),
        ]))
        .expect("valid env")
        .expect("variables present");

        assert_eq!(settings.retry.max_attempts, 6);
        assert_eq!(settings.retry.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(settings.circuit_breaker.reset_timeout, Duration::from_millis(2500));
        assert_eq!(settings.health.unhealthy_failure_rate, 0.25);
    }

    #[test]
    fn test_env_absent_or_invalid() {
        assert_eq!(ResilienceSettings::from_env_with(lookup(&[])), Ok(None));

        let err = ResilienceSettings::from_env_with(lookup(&[(ENV_RETRY_MAX_ATTEMPTS, "many")]))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::Load { .. }));

        let err = ResilienceSettings::from_env_with(lookup(&[(ENV_RETRY_MAX_ATTEMPTS, "0")]))
            .expect_err("zero attempts");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_parse_partial_toml() {
        let contents = r#"
            [retry]
            max_attempts = 4
            base_delay = 250

            [circuit_breaker]
            failure_threshold = 2
            timeout_threshold = 800
        "#;
        let settings =
            parse_settings(contents, Path::new("resilience.toml")).expect("valid TOML settings");

        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.retry.max_delay, Some(DEFAULT_MAX_DELAY));
        assert_eq!(settings.circuit_breaker.timeout_threshold, Some(Duration::from_millis(800)));
        assert_eq!(settings.health, HealthSettings::default());
    }

    #[test]
    fn test_load_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().expect("temp file");
        write!(file, r#"{{"health": {{"window": 50, "unhealthy_failure_rate": 0.3}}}}"#)
            .expect("write settings");

        let settings = ResilienceSettings::load_from_file(file.path()).expect("load settings");
        assert_eq!(settings.health.window, 50);
        assert_eq!(settings.retry, RetrySettings::default());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let err = parse_settings("{not json", Path::new("apiforge.json")).expect_err("bad json");
        assert!(matches!(err, ConfigError::Load { .. }));

        let err = parse_settings("", Path::new("apiforge.yaml")).expect_err("bad extension");
        assert!(matches!(err, ConfigError::Load { .. }));

        let err = parse_settings(r#"{"health": {"unhealthy_failure_rate": 2.0}}"#, Path::new("a.json"))
            .expect_err("rate out of range");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_presets_build_valid_policies() {
        for preset in PolicyPreset::ALL {
            let options: RecoveryPolicyOptions<String, CommonError> =
                preset.options().expect("preset options");
            assert!(create_recovery_policy(options).is_ok(), "preset {preset} must be valid");
        }

        let rate_limited: RecoveryPolicyOptions<String, CommonError> =
            apply_preset("rate-limited").expect("known preset");
        let throttled = &rate_limited.error_policies[&ErrorKind::RateLimit];
        assert_eq!(throttled.backoff(), Backoff::Fixed);
        assert_eq!(throttled.max_attempts(), 5);
    }

    #[test]
    fn test_unknown_preset() {
        let err = apply_preset::<String, CommonError>("turbo").expect_err("unknown preset");
        assert_eq!(err, ConfigError::UnknownPreset { name: "turbo".to_string() });
        assert_eq!("Conservative".parse::<PolicyPreset>(), Ok(PolicyPreset::Conservative));
    }

    #[test]
    fn test_strategy_for_kind_uses_settings() {
        let settings = RetrySettings { max_attempts: 4, ..RetrySettings::default() };
        let linear = strategy_for_kind(RetryKind::Linear, &settings).expect("valid strategy");
        assert_eq!(linear.backoff(), Backoff::Linear);
        assert_eq!(linear.max_attempts(), 4);
        assert!(!linear.jitter());
    }
}
