//! Exact sums of cell values.
//!
//! An [`ExactSum`] holds the finite part of a sum as an arbitrary precision
//! binary fraction, so the result does not depend on the order values were
//! added in, on whether they were added one by one or as `(value, count)`
//! runs, or on values later being removed again. Infinities and NaN are
//! counted separately.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};
use std::fmt;

/// A cell value decomposed into `mantissa * 2^exponent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExactValue {
    Finite { mantissa: i128, exponent: i32 },
    PosInfinity,
    NegInfinity,
    NaN,
}

impl ExactValue {
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return ExactValue::NaN;
        }
        if value.is_infinite() {
            return if value > 0.0 {
                ExactValue::PosInfinity
            } else {
                ExactValue::NegInfinity
            };
        }
        let bits = value.to_bits();
        let biased = ((bits >> 52) & 0x7ff) as i32;
        let fraction = bits & ((1u64 << 52) - 1);
        let (mut mantissa, mut exponent) = if biased == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1u64 << 52), biased - 1075)
        };
        if mantissa == 0 {
            return ExactValue::Finite {
                mantissa: 0,
                exponent: 0,
            };
        }
        let zeros = mantissa.trailing_zeros();
        mantissa >>= zeros;
        exponent += zeros as i32;
        let mantissa = mantissa as i128;
        ExactValue::Finite {
            mantissa: if value < 0.0 { -mantissa } else { mantissa },
            exponent,
        }
    }
}

/// Order independent, exact running sum.
#[derive(Clone, Default)]
pub struct ExactSum {
    /// The finite part is `scaled * 2^exponent`.
    scaled: BigInt,
    exponent: i32,
    pos_infinities: i64,
    neg_infinities: i64,
    nans: i64,
}

impl ExactSum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` copies of `value`.
    pub fn add(&mut self, value: ExactValue, count: u64) {
        self.accumulate(value, i128::from(count));
    }

    /// Take away `count` copies of `value` added earlier.
    pub fn remove(&mut self, value: ExactValue, count: u64) {
        self.accumulate(value, -i128::from(count));
    }

    pub fn merge(&mut self, other: &ExactSum) {
        self.pos_infinities += other.pos_infinities;
        self.neg_infinities += other.neg_infinities;
        self.nans += other.nans;
        self.add_scaled(other.scaled.clone(), other.exponent);
    }

    /// Whether no infinity or NaN is part of the sum.
    pub fn is_finite(&self) -> bool {
        self.pos_infinities == 0 && self.neg_infinities == 0 && self.nans == 0
    }

    /// The finite sum as `numerator / denominator`, with a positive
    /// power-of-two denominator. `None` if the sum is not finite.
    pub fn to_fraction(&self) -> Option<(BigInt, BigInt)> {
        if !self.is_finite() {
            return None;
        }
        if self.exponent >= 0 {
            Some((&self.scaled << self.exponent as usize, BigInt::one()))
        } else {
            Some((
                self.scaled.clone(),
                BigInt::one() << self.exponent.unsigned_abs() as usize,
            ))
        }
    }

    /// The sum if it is a finite integer.
    pub fn to_integer(&self) -> Option<BigInt> {
        let (numerator, denominator) = self.to_fraction()?;
        (&numerator % &denominator)
            .is_zero()
            .then(|| numerator / denominator)
    }

    /// The sum rounded once to the nearest `f64`, ties to even.
    pub fn to_f64(&self) -> f64 {
        if self.nans > 0 || (self.pos_infinities > 0 && self.neg_infinities > 0) {
            f64::NAN
        } else if self.pos_infinities > 0 {
            f64::INFINITY
        } else if self.neg_infinities > 0 {
            f64::NEG_INFINITY
        } else {
            round_to_f64(&self.scaled, self.exponent)
        }
    }

    fn accumulate(&mut self, value: ExactValue, count: i128) {
        match value {
            ExactValue::Finite { mantissa, exponent } => {
                self.add_scaled(BigInt::from(mantissa) * BigInt::from(count), exponent);
            }
            ExactValue::PosInfinity => self.pos_infinities += count as i64,
            ExactValue::NegInfinity => self.neg_infinities += count as i64,
            ExactValue::NaN => self.nans += count as i64,
        }
    }

    fn add_scaled(&mut self, scaled: BigInt, exponent: i32) {
        if scaled.is_zero() {
            return;
        }
        if self.scaled.is_zero() {
            self.scaled = scaled;
            self.exponent = exponent;
        } else if exponent >= self.exponent {
            self.scaled += scaled << (exponent - self.exponent) as usize;
        } else {
            let shift = (self.exponent - exponent) as usize;
            self.scaled = (std::mem::take(&mut self.scaled) << shift) + scaled;
            self.exponent = exponent;
        }
    }
}

impl PartialEq for ExactSum {
    fn eq(&self, other: &Self) -> bool {
        self.pos_infinities == other.pos_infinities
            && self.neg_infinities == other.neg_infinities
            && self.nans == other.nans
            && self.to_fraction() == other.to_fraction()
    }
}

impl fmt::Debug for ExactSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExactSum")
            .field("scaled", &self.scaled)
            .field("exponent", &self.exponent)
            .field("value", &self.to_f64())
            .finish()
    }
}

/// `value * 2^exponent` rounded to the nearest `f64`, ties to even.
pub fn round_to_f64(value: &BigInt, exponent: i32) -> f64 {
    if value.is_zero() {
        return 0.0;
    }
    let sign = if value.sign() == Sign::Minus { -1.0 } else { 1.0 };
    let magnitude = value.magnitude();
    let bits = magnitude.bits() as i64;
    let top = bits - 1 + i64::from(exponent);
    if top > 1023 {
        return sign * f64::INFINITY;
    }
    // Significant bits available at this magnitude; fewer for subnormals.
    let keep = if top >= -1022 { 53 } else { top + 1075 };
    if keep < 0 {
        return sign * 0.0;
    }
    let drop = bits - keep;
    let mantissa = if drop <= 0 {
        low_digit(&(magnitude << (-drop) as usize))
    } else {
        let drop = drop as usize;
        let kept = magnitude >> drop;
        let remainder = magnitude - (&kept << drop);
        let half = BigUint::one() << (drop - 1);
        let mantissa = low_digit(&kept);
        if remainder > half || (remainder == half && mantissa % 2 == 1) {
            mantissa + 1
        } else {
            mantissa
        }
    };
    sign * (mantissa as f64) * pow2(i64::from(exponent) + drop)
}

fn low_digit(value: &BigUint) -> u64 {
    value.iter_u64_digits().next().unwrap_or(0)
}

/// `2^power` for `power` in the `f64` range, subnormals included.
fn pow2(power: i64) -> f64 {
    if power >= -1022 {
        f64::from_bits(((power + 1023) as u64) << 52)
    } else {
        f64::from_bits(1u64 << (power + 1074))
    }
}
