//! Scheduler time keeping: nanosecond instants, spans, and clock sources.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Instant;

use crate::units::Nanosecs;

macro_rules! time_unit {
    ($name: ident) => {
        #[allow(missing_docs)]
        #[derive(
            Debug,
            Default,
            Copy,
            Clone,
            PartialOrd,
            Ord,
            PartialEq,
            Eq,
            Hash,
            derive_more::Add,
            derive_more::Display,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u128);

        impl $name {
            /// Equivalent to Self::new(0).
            pub const ZERO: $name = Self::new(0);
            /// Equivalent to Self::new(1).
            pub const ONE: $name = Self::new(1);
            /// Equivalent to Self::new(u128::MAX).
            pub const MAX: $name = Self::new(u128::MAX);

            /// Create a new time value.
            pub const fn new(value: u128) -> Self {
                Self(value)
            }

            /// Convert the time value into a `u128`.
            pub const fn into_u128(self) -> u128 {
                self.0
            }
        }
    };
}

time_unit!(Time);

time_unit!(Delta);

impl Delta {
    /// Convert the delta into nanoseconds.
    pub fn into_ns(self) -> Nanosecs {
        assert!(self.0 <= u128::from(u64::MAX));
        Nanosecs::new(self.0 as u64)
    }
}

impl Add<Delta> for Time {
    type Output = Time;

    fn add(self, rhs: Delta) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub<Delta> for Time {
    type Output = Time;

    fn sub(self, rhs: Delta) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Sub<Time> for Time {
    type Output = Delta;

    fn sub(self, rhs: Time) -> Self::Output {
        Delta::new(self.0 - rhs.0)
    }
}

impl AddAssign<Delta> for Time {
    fn add_assign(&mut self, rhs: Delta) {
        *self = Self(self.0 + rhs.0)
    }
}

impl SubAssign<Delta> for Time {
    fn sub_assign(&mut self, rhs: Delta) {
        *self = Self(self.0 - rhs.0)
    }
}

/// A monotonic nanosecond time source.
///
/// The scheduler reads the clock once per batch and caches the value; hosts
/// with their own notion of time implement this seam.
pub trait Clock {
    /// The current instant.
    fn now(&mut self) -> Time;
}

/// Wall-clock time anchored at construction, via [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&mut self) -> Time {
        Time::new(self.origin.elapsed().as_nanos())
    }
}

/// A clock that only moves when told to. Intended for simulated hosts and
/// tests.
#[derive(Debug, Default, Copy, Clone, derive_new::new)]
pub struct ManualClock {
    now: Time,
}

impl ManualClock {
    /// Advance the clock by `delta`.
    pub fn advance(&mut self, delta: Delta) {
        self.now += delta;
    }

    /// Move the clock to `at`. Going backwards is not allowed.
    pub fn set(&mut self, at: Time) {
        assert!(at >= self.now);
        self.now = at;
    }
}

impl Clock for ManualClock {
    fn now(&mut self) -> Time {
        self.now
    }
}
