//! Cell value types a grid can hold.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::sum::ExactValue;

/// A scalar that can be stored in a chunk.
///
/// Identity between two values is decided by [`CellValue::key`], not by
/// `PartialEq`, so that floating point sentinels such as `NaN` can be used
/// as no-data values and `-0.0`/`0.0` are treated as one value.
///
/// `Display` and `FromStr` must round-trip; grid manifests store no-data
/// values as text.
pub trait CellValue:
    Copy + PartialOrd + fmt::Debug + fmt::Display + FromStr + Serialize + DeserializeOwned + 'static
{
    /// Hashable, totally ordered identity of a value.
    type Key: Copy + Eq + Ord + Hash + fmt::Debug;

    /// Name recorded in persisted chunks so a cache is never reopened with
    /// the wrong cell type.
    const TYPE_NAME: &'static str;

    fn key(self) -> Self::Key;

    fn to_f64(self) -> f64;

    /// The value as an exact binary fraction, for summing.
    fn exact(self) -> ExactValue;

    /// Addition used by `add_to_cell`. Integer types saturate.
    fn plus(self, other: Self) -> Self;

    /// Whether two values are the same cell value.
    fn same(self, other: Self) -> bool {
        self.key() == other.key()
    }
}

macro_rules! int_cell {
    ($($ty:ty),*) => {
        $(
            impl CellValue for $ty {
                type Key = $ty;
                const TYPE_NAME: &'static str = stringify!($ty);

                fn key(self) -> Self::Key {
                    self
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn exact(self) -> ExactValue {
                    ExactValue::Finite {
                        mantissa: i128::from(self),
                        exponent: 0,
                    }
                }

                fn plus(self, other: Self) -> Self {
                    self.saturating_add(other)
                }
            }
        )*
    };
}

macro_rules! float_cell {
    ($($ty:ty => $bits:ty),*) => {
        $(
            impl CellValue for $ty {
                type Key = $bits;
                const TYPE_NAME: &'static str = stringify!($ty);

                fn key(self) -> Self::Key {
                    if self.is_nan() {
                        <$ty>::NAN.to_bits()
                    } else if self == 0.0 {
                        (0.0 as $ty).to_bits()
                    } else {
                        self.to_bits()
                    }
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn exact(self) -> ExactValue {
                    ExactValue::from_f64(f64::from(self))
                }

                fn plus(self, other: Self) -> Self {
                    self + other
                }
            }
        )*
    };
}

int_cell!(i32, i64);
float_cell!(f32 => u32, f64 => u64);
