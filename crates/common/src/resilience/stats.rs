//! Per-service recovery statistics and health aggregation

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use super::error::ErrorKind;

/// Accumulated recovery metrics for one service key
///
/// A *recovery* is an operation whose first attempt failed and for which the
/// engine retried or fell back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub total_retries: u64,
    /// Mean duration of successful recoveries
    #[serde(with = "crate::utils::duration_millis")]
    pub average_recovery_time: Duration,
    #[serde(with = "crate::utils::duration_millis")]
    pub average_operation_duration: Duration,
    #[serde(default, with = "crate::utils::option_duration_millis")]
    pub fastest_operation: Option<Duration>,
    #[serde(default, with = "crate::utils::option_duration_millis")]
    pub slowest_operation: Option<Duration>,
    /// Terminal failures by kind, including those a fallback absorbed
    pub error_distribution: HashMap<ErrorKind, u64>,
    /// Closed to open transitions
    pub circuit_breaker_trips: u64,
    /// Calls rejected by an open breaker
    pub circuit_breaker_activations: u64,
    pub fallback_invocations: u64,
}

impl RecoveryStats {
    /// Fraction of operations that produced a result, 1.0 when none ran
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 1.0;
        }
        self.successful_operations as f64 / self.total_operations as f64
    }

    /// Fraction of attempts beyond the first, over all attempts
    pub fn retry_ratio(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.total_retries as f64 / self.total_attempts as f64
    }
}

/// Final outcome of one engine call
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OperationOutcome {
    /// The caller received a value (from the operation or a fallback)
    pub succeeded: bool,
    /// The first attempt failed and the engine retried or fell back
    pub recovery: bool,
    pub duration: Duration,
    /// Kind of the terminal failure of the primary path, if any
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug)]
struct ServiceRecord {
    stats: RecoveryStats,
    total_operation_time: Duration,
    total_recovery_time: Duration,
    recent: VecDeque<bool>,
    window: usize,
}

impl ServiceRecord {
    fn new(window: usize) -> Self {
        Self {
            stats: RecoveryStats::default(),
            total_operation_time: Duration::ZERO,
            total_recovery_time: Duration::ZERO,
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    fn push_recent(&mut self, success: bool) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn recent_failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64
    }

    fn record_operation(&mut self, outcome: &OperationOutcome) {
        let stats = &mut self.stats;
        stats.total_operations += 1;
        if outcome.succeeded {
            stats.successful_operations += 1;
        } else {
            stats.failed_operations += 1;
        }

        if let Some(kind) = &outcome.error_kind {
            *stats.error_distribution.entry(kind.clone()).or_insert(0) += 1;
        }

        self.total_operation_time = self.total_operation_time.saturating_add(outcome.duration);
        stats.average_operation_duration = average(self.total_operation_time, stats.total_operations);
        stats.fastest_operation =
            Some(stats.fastest_operation.map_or(outcome.duration, |d| d.min(outcome.duration)));
        stats.slowest_operation =
            Some(stats.slowest_operation.map_or(outcome.duration, |d| d.max(outcome.duration)));

        if outcome.recovery {
            if outcome.succeeded {
                stats.successful_recoveries += 1;
                self.total_recovery_time = self.total_recovery_time.saturating_add(outcome.duration);
                stats.average_recovery_time =
                    average(self.total_recovery_time, stats.successful_recoveries);
            } else {
                stats.failed_recoveries += 1;
            }
        }
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => total / count,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// Engine-owned map of service key to statistics
#[derive(Debug)]
pub(crate) struct StatsRegistry {
    records: DashMap<String, Arc<Mutex<ServiceRecord>>>,
    window: usize,
}

impl StatsRegistry {
    pub fn new(window: usize) -> Self {
        Self { records: DashMap::new(), window }
    }

    fn with_record<R>(&self, key: &str, f: impl FnOnce(&mut ServiceRecord) -> R) -> R {
        let record = match self.records.get(key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let window = self.window;
                let created = self
                    .records
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(ServiceRecord::new(window))));
                Arc::clone(created.value())
            }
        };
        let mut guard = record.lock();
        f(&mut guard)
    }

    /// One attempt completed; retries are attempts after the first
    pub fn record_attempt(&self, key: &str, success: bool, is_retry: bool) {
        self.with_record(key, |record| {
            record.stats.total_attempts += 1;
            if is_retry {
                record.stats.total_retries += 1;
            }
            record.push_recent(success);
        });
    }

    pub fn record_operation(&self, key: &str, outcome: &OperationOutcome) {
        self.with_record(key, |record| record.record_operation(outcome));
    }

    pub fn record_trip(&self, key: &str) {
        self.with_record(key, |record| record.stats.circuit_breaker_trips += 1);
    }

    /// A call was rejected by an open breaker
    pub fn record_activation(&self, key: &str) {
        self.with_record(key, |record| record.stats.circuit_breaker_activations += 1);
    }

    pub fn record_fallback(&self, key: &str) {
        self.with_record(key, |record| record.stats.fallback_invocations += 1);
    }

    /// Stats for `key`; zeroed for unseen keys
    pub fn get(&self, key: &str) -> RecoveryStats {
        self.records.get(key).map(|record| record.value().lock().stats.clone()).unwrap_or_default()
    }

    pub fn recent_failure_rate(&self, key: &str) -> f64 {
        self.records.get(key).map_or(0.0, |record| record.value().lock().recent_failure_rate())
    }

    /// Forget one key, or every key when `key` is `None`
    pub fn reset(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.records.remove(key);
            }
            None => self.records.clear(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Health of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy: bool,
    /// `None` when the service never went through a breaker
    pub circuit_state: Option<CircuitState>,
    pub breaker_failures: u32,
    pub recent_failure_rate: f64,
    pub success_rate: f64,
    pub total_operations: u64,
}

/// Aggregated health across all known services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub circuit_breakers_open: usize,
    /// 0-100; 100 when no services are known
    pub overall_health: f64,
    pub generated_at: DateTime<Utc>,
    pub services: Vec<ServiceHealth>,
}

impl HealthReport {
    /// Compile a report over the union of keys known to either registry
    ///
    /// A service is unhealthy when its breaker is open or, without a
    /// breaker, when its recent failure rate exceeds `unhealthy_failure_rate`.
    pub(crate) fn compile(
        stats: &StatsRegistry,
        breakers: &CircuitBreakerRegistry,
        unhealthy_failure_rate: f64,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut snapshots: HashMap<String, _> = breakers.snapshots().into_iter().collect();
        let mut keys = stats.keys();
        keys.extend(snapshots.keys().cloned());
        keys.sort();
        keys.dedup();

        let services: Vec<ServiceHealth> = keys
            .into_iter()
            .map(|service| {
                let snapshot = snapshots.remove(&service);
                let service_stats = stats.get(&service);
                let recent_failure_rate = stats.recent_failure_rate(&service);
                let healthy = match &snapshot {
                    Some(snapshot) => snapshot.state != CircuitState::Open,
                    None => recent_failure_rate <= unhealthy_failure_rate,
                };

                ServiceHealth {
                    healthy,
                    circuit_state: snapshot.as_ref().map(|s| s.state),
                    breaker_failures: snapshot.as_ref().map_or(0, |s| s.failures),
                    recent_failure_rate,
                    success_rate: service_stats.success_rate(),
                    total_operations: service_stats.total_operations,
                    service,
                }
            })
            .collect();

        let total_services = services.len();
        let healthy_services = services.iter().filter(|s| s.healthy).count();
        let circuit_breakers_open =
            services.iter().filter(|s| s.circuit_state == Some(CircuitState::Open)).count();
        let overall_health = if total_services == 0 {
            100.0
        } else {
            100.0 * healthy_services as f64 / total_services as f64
        };

        Self {
            total_services,
            healthy_services,
            unhealthy_services: total_services - healthy_services,
            circuit_breakers_open,
            overall_health,
            generated_at,
            services,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceHealth> {
        self.services.iter().find(|s| s.service == name)
    }
}
