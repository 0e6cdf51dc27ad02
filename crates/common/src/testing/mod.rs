//! Testing utilities and helpers
//!
//! - **[`assertions`]**: assertion macros and helpers for recovery outcomes
//! - **[`operations`]**: scripted async operations and a classifiable error
//! - **[`logging`]**: tracing subscriber for test output (`test-utils`)
//!
//! ## Usage
//!
//! ```rust
//! # #[cfg(feature = "runtime")]
//! # {
//! use apiforge_common::resilience::ErrorKind;
//! use apiforge_common::testing::{MockClock, ScriptedOperation};
//!
//! let clock = MockClock::new();
//! clock.advance(std::time::Duration::from_secs(5));
//!
//! let op = ScriptedOperation::new().fail_times(2, ErrorKind::Network);
//! assert_eq!(op.calls(), 0);
//! # }
//! ```

pub mod assertions;
#[cfg(any(feature = "test-utils", test))]
pub mod logging;
pub mod operations;

// Macros exported with #[macro_export] live at the crate root.
pub use assertions::{assert_approx_eq, assert_duration_in_range};
#[cfg(any(feature = "test-utils", test))]
pub use logging::init_test_tracing;
pub use operations::{ScriptedOperation, TestError};

pub use crate::resilience::{Clock, MockClock, SystemClock};
