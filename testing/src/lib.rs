//! # Venue Testing
//!
//! Testing utilities for reducers and services in the venue booking workspace.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - [`run_effects`], which drives returned effects and collects the actions
//!   they would feed back, without a store
//! - [`init_test_tracing`] so failing tests show the structured log trail
//!
//! ## Example
//!
//! ```ignore
//! use venue_testing::{run_effects, test_clock, ReducerTest};
//!
//! ReducerTest::new(CheckoutReducer::new())
//!     .with_env(test_environment())
//!     .given_state(CheckoutState::default())
//!     .when_action(CheckoutAction::CancelCheckout { attempt_id })
//!     .then_state(|state| assert!(state.attempt(&attempt_id).is_none()))
//!     .run();
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Mutex;
use venue_core::environment::Clock;

mod reducer_test;

pub use reducer_test::{assertions, run_effects, ReducerTest};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Duration, Mutex, TimeZone, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use venue_testing::mocks::FixedClock;
    /// use venue_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// Noon on the first of June of `year`, for waiver-year tests
        #[must_use]
        pub fn in_year(year: i32) -> Self {
            let time = Utc
                .with_ymd_and_hms(year, 6, 1, 12, 0, 0)
                .single()
                .unwrap_or_else(Utc::now);
            Self::new(time)
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            if let Ok(mut time) = self.time.lock() {
                *time += by;
            }
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            if let Ok(mut time) = self.time.lock() {
                *time = to;
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.time.lock().map_or_else(|poisoned| *poisoned.into_inner(), |time| *time)
        }
    }

    /// Default fixed clock for tests (2026-03-14 19:30:00 UTC, a Saturday event night)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 19, 30, 0)
                .single()
                .unwrap_or_else(Utc::now),
        )
    }
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn` so passing tests stay quiet.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub use mocks::{test_clock, FixedClock, ManualClock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_fixed_clock_is_stable() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.current_year(), 2026);
    }

    #[test]
    fn test_fixed_clock_in_year() {
        assert_eq!(FixedClock::in_year(2031).now().year(), 2031);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = test_clock().now();
        let clock = ManualClock::new(start);

        clock.advance(Duration::days(300));

        assert_eq!(clock.now(), start + Duration::days(300));
        assert_eq!(clock.current_year(), 2027);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }
}
