macro_rules! identifier {
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
            derive_more::Display,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Equivalent to Self::new(0).
            pub const ZERO: $name = Self::new(0);
            /// Equivalent to Self::new(1).
            pub const ONE: $name = Self::new(1);

            /// Create a new ID.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Convert the ID into a `u64`.
            pub const fn into_u64(self) -> u64 {
                self.0
            }
        }
    };
}
