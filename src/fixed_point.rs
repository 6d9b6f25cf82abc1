//! Fixed-point arithmetic for meter measurements and aggregation sums.
//!
//! Mirrors `original_source/src/util/FixedPoint.h` instantiated as
//! `FixedPoint<int64_t, 16>`: 16 fractional bits, wire-encoded as the raw
//! two's-complement `i64`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};

const FRACTIONAL_BITS: u32 = 16;
const SCALE: i64 = 1 << FRACTIONAL_BITS;

/// A signed fixed-point number with 16 fractional bits, backed by `i64`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FixedPoint(i64);

impl FixedPoint {
    /// Constructs a `FixedPoint` from the raw scaled integer (the wire representation).
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw scaled integer, as serialized on the wire.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Constructs a `FixedPoint` from an integral value.
    pub fn from_int(value: i64) -> Self {
        Self(value * SCALE)
    }

    /// Constructs a `FixedPoint` from a floating-point value, truncating to the nearest tick.
    pub fn from_f64(value: f64) -> Self {
        Self((value * SCALE as f64).round() as i64)
    }

    /// Converts back to a floating-point approximation.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    /// The additive identity, used to initialize per-element aggregation accumulators.
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl Add for FixedPoint {
    type Output = FixedPoint;
    fn add(self, rhs: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 + rhs.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: FixedPoint) {
        self.0 += rhs.0;
    }
}

impl Sub for FixedPoint {
    type Output = FixedPoint;
    fn sub(self, rhs: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 - rhs.0)
    }
}

impl Neg for FixedPoint {
    type Output = FixedPoint;
    fn neg(self) -> FixedPoint {
        FixedPoint(-self.0)
    }
}

impl Sum for FixedPoint {
    fn sum<I: Iterator<Item = FixedPoint>>(iter: I) -> Self {
        iter.fold(FixedPoint::zero(), Add::add)
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}

/// Pointwise-adds `rhs` into `lhs`, extending `lhs` with zeros if `rhs` is longer.
///
/// Both the tree aggregation and the agreement/echo phases need to combine
/// equal-length measurement vectors; this helper is shared by both.
pub fn pointwise_add(lhs: &mut Vec<FixedPoint>, rhs: &[FixedPoint]) {
    if lhs.len() < rhs.len() {
        lhs.resize(rhs.len(), FixedPoint::zero());
    }
    for (l, r) in lhs.iter_mut().zip(rhs.iter()) {
        *l += *r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw() {
        let v = FixedPoint::from_f64(12.5);
        let raw = v.raw();
        assert_eq!(FixedPoint::from_raw(raw), v);
    }

    #[test]
    fn pointwise_add_extends_shorter_vector() {
        let mut lhs = vec![FixedPoint::from_int(1)];
        let rhs = vec![FixedPoint::from_int(2), FixedPoint::from_int(3)];
        pointwise_add(&mut lhs, &rhs);
        assert_eq!(lhs, vec![FixedPoint::from_int(3), FixedPoint::from_int(3)]);
    }

    #[test]
    fn addition_is_exact_for_integers() {
        let a = FixedPoint::from_int(100);
        let b = FixedPoint::from_int(200);
        assert_eq!((a + b).to_f64(), 300.0);
    }
}
