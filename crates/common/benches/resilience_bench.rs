//! Recovery engine benchmarks
//!
//! Backoff and jitter calculations, breaker admission on the hot path, and
//! full policy execution with and without failures.
//!
//! Run with: `cargo bench --bench resilience_bench -p apiforge-common`

use std::sync::Arc;
use std::time::Duration;

use apiforge_common::resilience::{
    create_recovery_policy, fallback_fn, Backoff, CircuitBreakerConfig, ErrorKind, MockClock,
    RecoveryEngine, RecoveryPolicyOptions, RetryContext, RetryKind, RetryStrategy,
};
use apiforge_common::testing::{ScriptedOperation, TestError};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Delay Calculations
// ============================================================================

fn bench_backoff_calculations(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_calculations");
    let attempts = [1u32, 2, 5, 10, 40];

    for kind in [RetryKind::Exponential, RetryKind::Linear, RetryKind::Fixed] {
        let strategy = RetryStrategy::builder()
            .backoff(RetryStrategy::preset(kind).backoff())
            .base_delay(Duration::from_millis(100))
            .no_jitter()
            .build()
            .expect("valid benchmark strategy");

        group.bench_with_input(
            BenchmarkId::new("base_delay_for_attempt", kind.as_str()),
            &strategy,
            |b, strategy| {
                b.iter(|| {
                    for attempt in attempts {
                        black_box(strategy.base_delay_for_attempt(black_box(attempt)));
                    }
                });
            },
        );
    }

    group.bench_function("unbounded_exponential_saturation", |b| {
        let backoff = Backoff::Exponential { multiplier: 10.0 };
        b.iter(|| black_box(backoff.delay(Duration::from_secs(1), black_box(u32::MAX))));
    });

    group.finish();
}

fn bench_jitter(c: &mut Criterion) {
    let mut group = c.benchmark_group("jitter");
    let strategy = RetryStrategy::preset(RetryKind::Exponential);
    let delays = [Duration::from_millis(10), Duration::from_secs(1), Duration::from_secs(30)];

    group.bench_function("apply_jitter", |b| {
        b.iter(|| {
            for delay in delays {
                black_box(strategy.apply_jitter(black_box(delay)));
            }
        });
    });

    group.finish();
}

// ============================================================================
// Engine Execution
// ============================================================================

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

fn bench_circuit_breaker_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_paths");
    let runtime = build_runtime();

    group.bench_function("closed_success", |b| {
        let engine = Arc::new(RecoveryEngine::new());
        let op = ScriptedOperation::new();
        b.to_async(&runtime).iter(|| {
            let engine = Arc::clone(&engine);
            let op = op.clone();
            async move {
                let result = engine.execute_with_circuit_breaker(|| op.call(), "bench", None).await;
                black_box(result).expect("closed breaker admits");
            }
        });
    });

    group.bench_function("open_rejection", |b| {
        let engine = Arc::new(RecoveryEngine::with_clock(MockClock::new()));
        engine.open_circuit_breaker("bench");
        let op = ScriptedOperation::new();
        b.to_async(&runtime).iter(|| {
            let engine = Arc::clone(&engine);
            let op = op.clone();
            async move {
                let result = engine.execute_with_circuit_breaker(|| op.call(), "bench", None).await;
                black_box(result).expect_err("open breaker rejects");
            }
        });
    });

    group.bench_function("trip_and_recover", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .reset_timeout(Duration::from_secs(1))
            .build()
            .expect("valid benchmark breaker");
        let failing = ScriptedOperation::always_failing(ErrorKind::Server);
        let healthy = ScriptedOperation::new();

        b.to_async(&runtime).iter(|| {
            let config = config.clone();
            let failing = failing.clone();
            let healthy = healthy.clone();
            async move {
                let clock = MockClock::new();
                let engine = RecoveryEngine::with_clock(clock.clone());
                for _ in 0..3 {
                    let _ = engine
                        .execute_with_circuit_breaker(|| failing.call(), "bench", Some(&config))
                        .await;
                }
                clock.advance(Duration::from_secs(1));
                let result = engine.execute_with_circuit_breaker(|| healthy.call(), "bench", None).await;
                black_box(result).expect("half-open trial succeeds");
            }
        });
    });

    group.finish();
}

fn bench_policy_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_execution");
    let runtime = build_runtime();

    let no_delay = RetryStrategy::builder()
        .max_attempts(3)
        .base_delay(Duration::ZERO)
        .no_jitter()
        .build()
        .expect("valid benchmark strategy");

    group.bench_function("retry_success_first_attempt", |b| {
        let engine = Arc::new(RecoveryEngine::new());
        let op = ScriptedOperation::new();
        b.to_async(&runtime).iter(|| {
            let engine = Arc::clone(&engine);
            let op = op.clone();
            let strategy = no_delay.clone();
            async move {
                let context = RetryContext::for_operation("bench");
                let result = engine.execute_with_retry(|| op.call(), &strategy, &context).await;
                black_box(result).expect("operation succeeds");
            }
        });
    });

    group.bench_function("policy_exhausted_with_fallback", |b| {
        let engine = Arc::new(RecoveryEngine::new());
        let policy = create_recovery_policy(
            RecoveryPolicyOptions::<u32, TestError>::new(no_delay.clone())
                .with_fallback_function(fallback_fn(|| async { Ok(0) })),
        )
        .expect("valid benchmark policy");
        let op = ScriptedOperation::always_failing(ErrorKind::Network);

        b.to_async(&runtime).iter(|| {
            let engine = Arc::clone(&engine);
            let policy = policy.clone();
            let op = op.clone();
            async move {
                let result = engine.execute_with_policy(|| op.call(), "bench", &policy).await;
                black_box(result).expect("fallback absorbs failure");
            }
        });
    });

    group.bench_function("health_report_100_services", |b| {
        let engine = RecoveryEngine::new();
        let op = ScriptedOperation::new();
        runtime.block_on(async {
            for i in 0..100 {
                let service = format!("service-{i}");
                let _ = engine.execute_with_circuit_breaker(|| op.call(), &service, None).await;
            }
        });
        b.iter(|| black_box(engine.get_health_metrics()));
    });

    group.finish();
}

criterion_group!(
    resilience,
    bench_backoff_calculations,
    bench_jitter,
    bench_circuit_breaker_paths,
    bench_policy_execution
);
criterion_main!(resilience);
