//! Grid statistics.
//!
//! [`Stats`] caches the count, sum and extremes of a grid's data cells.
//! Under [`StatsPolicy::Updated`] every value change is folded in as it
//! happens; under [`StatsPolicy::NotUpdated`] a change only marks the cache
//! stale and the next read rescans the grid chunk by chunk.

use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tilegrid_core::sum::round_to_f64;
use tilegrid_core::{CellValue, ChunkSummary, ExactSum};

/// When statistics are brought up to date.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPolicy {
    /// Maintained incrementally by every `set_cell`.
    #[default]
    Updated,
    /// Recomputed by a rescan when read after a change.
    NotUpdated,
}

/// How [`Stats::mean`] rounds to the requested scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    /// Away from zero
    Up,
    /// Towards zero
    Down,
    /// Towards positive infinity
    Ceiling,
    /// Towards negative infinity
    Floor,
    /// Nearest, ties away from zero
    HalfUp,
    /// Nearest, ties towards zero
    HalfDown,
    /// Nearest, ties to the even neighbour
    HalfEven,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stats<T> {
    policy: StatsPolicy,
    n: u64,
    sum: ExactSum,
    min: Option<T>,
    max: Option<T>,
    up_to_date: bool,
    /// Set when the value holding an extreme was overwritten; the counts
    /// are still exact but min/max need a rescan.
    extremes_stale: bool,
}

impl<T: CellValue> Stats<T> {
    /// Empty statistics that must be computed before use.
    pub fn new(policy: StatsPolicy) -> Self {
        Self {
            policy,
            n: 0,
            sum: ExactSum::new(),
            min: None,
            max: None,
            up_to_date: false,
            extremes_stale: false,
        }
    }

    /// Statistics already known to match `summary`.
    pub fn from_summary(policy: StatsPolicy, summary: ChunkSummary<T>) -> Self {
        let mut stats = Self::new(policy);
        stats.apply(summary);
        stats
    }

    pub fn policy(&self) -> StatsPolicy {
        self.policy
    }

    /// Whether every figure reflects the current cells.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date && !self.extremes_stale
    }

    /// Whether `n` and `sum` need a rescan.
    pub fn needs_rescan(&self) -> bool {
        !self.up_to_date
    }

    /// Whether `min` and `max` need a rescan.
    pub fn extremes_need_rescan(&self) -> bool {
        !self.is_up_to_date()
    }

    /// Replace the cached figures with a fresh rescan.
    pub fn apply(&mut self, summary: ChunkSummary<T>) {
        self.n = summary.n;
        self.sum = summary.sum;
        self.min = summary.min;
        self.max = summary.max;
        self.up_to_date = true;
        self.extremes_stale = false;
    }

    pub fn invalidate(&mut self) {
        self.up_to_date = false;
    }

    /// Fold in one cell changing from `old` to `new`.
    pub fn record_change(&mut self, old: T, new: T, no_data: T) {
        if old.same(new) {
            return;
        }
        match self.policy {
            StatsPolicy::NotUpdated => self.invalidate(),
            StatsPolicy::Updated if !self.up_to_date => {}
            StatsPolicy::Updated => {
                if !old.same(no_data) {
                    self.n -= 1;
                    self.sum.remove(old.exact(), 1);
                    let was_extreme = |extreme: Option<T>| extreme.is_some_and(|e| e.same(old));
                    if was_extreme(self.min) || was_extreme(self.max) {
                        self.extremes_stale = true;
                    }
                }
                if !new.same(no_data) {
                    self.n += 1;
                    self.sum.add(new.exact(), 1);
                    let ordered = new.partial_cmp(&new).is_some();
                    if ordered && !self.extremes_stale {
                        if self.min.map_or(true, |min| new < min) {
                            self.min = Some(new);
                        }
                        if self.max.map_or(true, |max| new > max) {
                            self.max = Some(new);
                        }
                    }
                }
                if self.n == 0 {
                    self.sum = ExactSum::new();
                    self.min = None;
                    self.max = None;
                    self.extremes_stale = false;
                }
            }
        }
    }

    /// Count of data cells.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Sum of data cells, rounded once to `f64`.
    pub fn sum(&self) -> f64 {
        self.sum.to_f64()
    }

    /// Sum of data cells without rounding.
    pub fn exact_sum(&self) -> &ExactSum {
        &self.sum
    }

    pub fn min(&self) -> Option<T> {
        self.min
    }

    pub fn max(&self) -> Option<T> {
        self.max
    }

    /// `sum / n` rounded to `scale` decimal places, or `None` for a grid
    /// without data cells.
    pub fn mean(&self, scale: u32, mode: RoundingMode) -> Option<f64> {
        (self.n > 0).then(|| divide(&self.sum, self.n, scale, mode))
    }
}

/// Divide `sum` by `n` and round to `scale` decimal places.
///
/// Finite sums are divided exactly; the rounded quotient is then converted
/// to `f64`. A sum holding an infinity or NaN gives that value back.
pub fn divide(sum: &ExactSum, n: u64, scale: u32, mode: RoundingMode) -> f64 {
    let Some((numerator, denominator)) = sum.to_fraction() else {
        return sum.to_f64() / n as f64;
    };
    let factor = BigInt::from(10u32).pow(scale);
    let quotient = round_div(&(numerator * &factor), &(denominator * n), mode);
    round_to_f64(&quotient, 0) / round_to_f64(&factor, 0)
}

/// `numerator / denominator` rounded per `mode`. `denominator` is positive.
fn round_div(numerator: &BigInt, denominator: &BigInt, mode: RoundingMode) -> BigInt {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.is_zero() {
        return quotient;
    }
    let positive = numerator.sign() == Sign::Plus;
    let half = (remainder.magnitude() * 2u32).cmp(denominator.magnitude());
    let round_away = match mode {
        RoundingMode::Up => true,
        RoundingMode::Down => false,
        RoundingMode::Ceiling => positive,
        RoundingMode::Floor => !positive,
        RoundingMode::HalfUp => half != Ordering::Less,
        RoundingMode::HalfDown => half == Ordering::Greater,
        RoundingMode::HalfEven => {
            half == Ordering::Greater || (half == Ordering::Equal && !(&quotient % 2u32).is_zero())
        }
    };
    match (round_away, positive) {
        (false, _) => quotient,
        (true, true) => quotient + 1u32,
        (true, false) => quotient - 1u32,
    }
}
