//! Scheduler units (time spans, data sizes, data rates).

use crate::time::{Delta, Time};

macro_rules! unit {
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
            derive_more::Sub,
            derive_more::AddAssign,
            derive_more::SubAssign,
            derive_more::Sum,
            derive_more::Display,
            derive_more::FromStr,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Equivalent to Self::new(0).
            pub const ZERO: $name = Self::new(0);
            /// Equivalent to Self::new(1).
            pub const ONE: $name = Self::new(1);
            /// Equivalent to Self::new(u64::MAX).
            pub const MAX: $name = Self::new(u64::MAX);

            /// Create a new value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Convert the value into a `u64`.
            pub const fn into_u64(self) -> u64 {
                self.0
            }
        }
    };
}

unit!(Nanosecs);
unit!(Microsecs);
unit!(Millisecs);
unit!(Secs);

#[allow(missing_docs)]
impl Nanosecs {
    pub fn into_time(self) -> Time {
        Time::new(u128::from(self.0))
    }

    pub fn into_delta(self) -> Delta {
        Delta::new(u128::from(self.0))
    }
}

#[allow(missing_docs)]
impl Microsecs {
    pub const fn into_ns(self) -> Nanosecs {
        Nanosecs::new(self.0 * 1_000)
    }

    pub fn into_time(self) -> Time {
        self.into_ns().into_time()
    }

    pub fn into_delta(self) -> Delta {
        self.into_ns().into_delta()
    }
}

#[allow(missing_docs)]
impl Millisecs {
    pub const fn into_us(self) -> Microsecs {
        Microsecs::new(self.0 * 1_000)
    }

    pub const fn into_ns(self) -> Nanosecs {
        self.into_us().into_ns()
    }

    pub fn into_time(self) -> Time {
        self.into_ns().into_time()
    }

    pub fn into_delta(self) -> Delta {
        self.into_ns().into_delta()
    }
}

#[allow(missing_docs)]
impl Secs {
    pub const fn into_ms(self) -> Millisecs {
        Millisecs::new(self.0 * 1_000)
    }

    pub const fn into_us(self) -> Microsecs {
        self.into_ms().into_us()
    }

    pub const fn into_ns(self) -> Nanosecs {
        self.into_us().into_ns()
    }

    pub fn into_time(self) -> Time {
        self.into_ns().into_time()
    }

    pub fn into_delta(self) -> Delta {
        self.into_ns().into_delta()
    }
}

impl From<Nanosecs> for Time {
    fn from(ns: Nanosecs) -> Self {
        ns.into_time()
    }
}

unit!(Bytes);
unit!(BytesPerSec);

const NS_PER_SEC: u128 = 1_000_000_000;

impl BytesPerSec {
    /// Returns the amount of time required to transmit `size` at this rate.
    ///
    /// A zero rate yields `Nanosecs::MAX`; callers clamp oversized delays.
    pub fn length(&self, size: Bytes) -> Nanosecs {
        if *self == BytesPerSec::ZERO {
            return Nanosecs::MAX;
        }
        if size == Bytes::ZERO {
            return Nanosecs::ZERO;
        }
        let delta = u128::from(size.into_u64()) * NS_PER_SEC / u128::from(self.into_u64());
        Nanosecs::new(u64::try_from(delta).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_length() {
        let rate = BytesPerSec::new(125_000);
        let size = Bytes::new(1_250);
        assert_eq!(rate.length(size), Millisecs::new(10).into_ns());
    }

    #[test]
    fn rate_length_zero_size() {
        let rate = BytesPerSec::new(125_000);
        assert_eq!(rate.length(Bytes::ZERO), Nanosecs::ZERO);
    }

    #[test]
    fn rate_length_zero_rate_saturates() {
        assert_eq!(BytesPerSec::ZERO.length(Bytes::ONE), Nanosecs::MAX);
    }

    #[test]
    fn second_conversion_chain() {
        assert_eq!(Secs::new(1).into_ns(), Nanosecs::new(1_000_000_000));
    }
}
