//! Custom assertions for recovery tests
//!
//! Macros and helpers for checking error messages, classified error kinds,
//! invocation counts and timing.

// These helpers exist to panic on mismatch.
#![allow(clippy::missing_panics_doc)]

use std::time::Duration;

/// Assert that an error's display output contains a substring
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "runtime")]
/// # {
/// let result: Result<(), String> = Err("circuit breaker is open for users".to_string());
/// apiforge_common::assert_error_contains!(result, "circuit breaker");
/// # }
/// ```
#[macro_export]
macro_rules! assert_error_contains {
    ($result:expr, $substring:expr) => {
        match &$result {
            Ok(_) => panic!("Expected error but got Ok"),
            Err(e) => {
                let error_msg = format!("{}", e);
                assert!(
                    error_msg.contains($substring),
                    "Error message '{}' does not contain '{}'",
                    error_msg,
                    $substring
                );
            }
        }
    };
}

/// Assert that a failed result classifies as the given
/// [`ErrorKind`](crate::resilience::ErrorKind)
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "runtime")]
/// # {
/// use apiforge_common::resilience::ErrorKind;
/// use apiforge_common::testing::TestError;
///
/// let result: Result<(), TestError> = Err(TestError::new(ErrorKind::RateLimit));
/// apiforge_common::assert_error_kind!(result, ErrorKind::RateLimit);
/// # }
/// ```
#[macro_export]
macro_rules! assert_error_kind {
    ($result:expr, $expected_kind:expr $(,)?) => {{
        match &$result {
            Ok(_) => panic!("Expected error but got Ok"),
            Err(e) => {
                let actual_kind = $crate::resilience::Classify::kind(e);
                let expected_kind = $expected_kind;
                assert_eq!(
                    actual_kind, expected_kind,
                    "Error kind mismatch: expected {:?}, got {:?}",
                    expected_kind, actual_kind
                );
            }
        }
    }};
}

/// Assert that an operation was invoked the expected number of times
#[macro_export]
macro_rules! assert_retry_count {
    ($actual:expr, $expected:expr) => {
        assert_eq!($actual, $expected, "Expected {} invocations but got {}", $expected, $actual);
    };
}

/// Assert that two values are approximately equal (for rates and ratios)
///
/// # Examples
///
/// ```
/// use apiforge_common::testing::assertions::assert_approx_eq;
///
/// assert_approx_eq(2.0 / 3.0, 0.6667, 0.001);
/// ```
pub fn assert_approx_eq(actual: f64, expected: f64, epsilon: f64) {
    let diff = (actual - expected).abs();
    assert!(
        diff < epsilon,
        "Values not approximately equal: {} vs {} (diff: {})",
        actual,
        expected,
        diff
    );
}

/// Assert that a duration is within `tolerance` of `expected`
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use apiforge_common::testing::assertions::assert_duration_in_range;
///
/// let actual = Duration::from_millis(1_150);
/// assert_duration_in_range(actual, Duration::from_secs(1), Duration::from_millis(300));
/// ```
pub fn assert_duration_in_range(actual: Duration, expected: Duration, tolerance: Duration) {
    let min = expected.saturating_sub(tolerance);
    let max = expected + tolerance;

    assert!(
        actual >= min && actual <= max,
        "Duration {:?} not in range [{:?}, {:?}]",
        actual,
        min,
        max
    );
}

#[cfg(test)]
mod tests {
    //! Unit tests for testing::assertions.
    use super::*;
    use crate::resilience::{ErrorKind, RecoveryError};
    use crate::testing::TestError;

    /// Validates the assert error contains scenario.
    #[test]
    fn test_assert_error_contains() {
        let result: Result<(), RecoveryError<TestError>> =
            Err(RecoveryError::Operation(TestError::new(ErrorKind::Network)));
        assert_error_contains!(result, "network");
    }

    /// Validates the assert error contains fails on ok scenario.
    #[test]
    #[should_panic(expected = "Expected error but got Ok")]
    fn test_assert_error_contains_fails_on_ok() {
        let result: Result<(), String> = Ok(());
        assert_error_contains!(result, "timeout");
    }

    /// Validates classification through the wrapped operation error.
    #[test]
    fn test_assert_error_kind_through_recovery_error() {
        let result: Result<(), RecoveryError<TestError>> =
            Err(RecoveryError::Operation(TestError::new(ErrorKind::Server)));
        assert_error_kind!(result, ErrorKind::Server);
    }

    #[test]
    #[should_panic(expected = "Error kind mismatch")]
    fn test_assert_error_kind_fails() {
        let result: Result<(), TestError> = Err(TestError::new(ErrorKind::Client));
        assert_error_kind!(result, ErrorKind::Network);
    }

    #[test]
    fn test_assert_retry_count() {
        assert_retry_count!(3_u32, 3);
    }

    /// Validates the assert approx eq scenario.
    #[test]
    fn test_assert_approx_eq() {
        assert_approx_eq(0.5, 0.5004, 0.001);
    }

    #[test]
    #[should_panic(expected = "Values not approximately equal")]
    fn test_assert_approx_eq_fails() {
        assert_approx_eq(0.5, 0.51, 0.001);
    }

    /// Validates jittered delays land inside the tolerance window.
    #[test]
    fn test_assert_duration_in_range() {
        let actual = Duration::from_millis(105);
        assert_duration_in_range(actual, Duration::from_millis(100), Duration::from_millis(10));
    }

    #[test]
    #[should_panic(expected = "not in range")]
    fn test_assert_duration_in_range_fails() {
        assert_duration_in_range(
            Duration::from_millis(150),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
    }
}
