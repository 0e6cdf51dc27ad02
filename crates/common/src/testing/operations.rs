//! Scripted async operations for exercising the recovery engine
//!
//! ```rust,ignore
//! let op = ScriptedOperation::new().fail_times(2, ErrorKind::Network);
//! let value = engine.execute_with_retry(|| op.call(), &strategy, &context).await?;
//! assert_eq!(op.calls(), 3);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::resilience::{Classify, ErrorKind};

/// Classifiable error produced by [`ScriptedOperation`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure on call {call}")]
pub struct TestError {
    pub kind: ErrorKind,
    /// 1-indexed invocation that produced the error, 0 when built directly
    pub call: u32,
}

impl TestError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, call: 0 }
    }
}

impl Classify for TestError {
    fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }
}

#[derive(Debug, Default)]
struct Script {
    failures: VecDeque<ErrorKind>,
    /// Outcome once `failures` is drained; `None` succeeds
    afterwards: Option<ErrorKind>,
    latency: Duration,
}

/// Operation that fails according to a script and records each invocation
///
/// Successful calls return the 1-indexed call number. Clones share the
/// script and the counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperation {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicU32>,
    invoked_at: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedOperation {
    /// Operation that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation whose every call fails with `kind`
    pub fn always_failing(kind: ErrorKind) -> Self {
        Self::new().then_always_fail(kind)
    }

    /// Queue one failure of `kind`
    pub fn fail_with(self, kind: ErrorKind) -> Self {
        self.script.lock().failures.push_back(kind);
        self
    }

    /// Queue `times` failures of `kind`
    pub fn fail_times(self, times: usize, kind: ErrorKind) -> Self {
        self.script.lock().failures.extend(std::iter::repeat(kind).take(times));
        self
    }

    /// Fail with `kind` once the queued failures are used up
    pub fn then_always_fail(self, kind: ErrorKind) -> Self {
        self.script.lock().afterwards = Some(kind);
        self
    }

    /// Sleep on the tokio timer before each outcome
    pub fn with_latency(self, latency: Duration) -> Self {
        self.script.lock().latency = latency;
        self
    }

    /// Invoke the operation
    pub fn call(&self) -> BoxFuture<'static, Result<u32, TestError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.invoked_at.lock().push(Instant::now());

        let (outcome, latency) = {
            let mut script = self.script.lock();
            let outcome = script.failures.pop_front().or_else(|| script.afterwards.clone());
            (outcome, script.latency)
        };

        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Some(kind) => Err(TestError { kind, call }),
                None => Ok(call),
            }
        }
        .boxed()
    }

    /// Number of invocations so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time between consecutive invocations
    pub fn gaps(&self) -> Vec<Duration> {
        self.invoked_at.lock().windows(2).map(|pair| pair[1].duration_since(pair[0])).collect()
    }
}
