//! # Steadfast Testing
//!
//! Testing utilities and deterministic mocks for the Steadfast delivery
//! layer:
//!
//! - [`mocks::FixedClock`] / [`test_clock`] — deterministic time
//! - [`queue_mocks::InMemoryQueue`] — a full in-memory broker with
//!   ack/requeue/reject semantics and a publish history to assert on
//! - [`queue_mocks::FlakyQueue`] — broker-outage injection
//! - [`store_mocks::InMemoryOutboxStore`] / [`store_mocks::InMemoryDeadLetterStore`]
//!   — single-mutex durable-store stand-ins
//!
//! ## Example
//!
//! ```ignore
//! use steadfast_testing::{test_clock, queue_mocks::InMemoryQueue};
//!
//! #[tokio::test]
//! async fn relay_publishes_pending_records() {
//!     let queue = Arc::new(InMemoryQueue::new());
//!     let store = Arc::new(InMemoryOutboxStore::new());
//!     // ... wire a relay against the mocks and assert on
//!     // queue.published_envelopes(...)
//! }
//! ```

use chrono::{DateTime, Utc};
use steadfast_core::environment::Clock;

pub mod queue_mocks;
pub mod store_mocks;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests.
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use steadfast_testing::mocks::FixedClock;
    /// use steadfast_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a compact tracing subscriber honoring `RUST_LOG`, for debugging
/// failing tests. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
pub use queue_mocks::{FlakyQueue, InMemoryQueue, envelope_message, test_message};
pub use store_mocks::{InMemoryDeadLetterStore, InMemoryOutboxStore};
