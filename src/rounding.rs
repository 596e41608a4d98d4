use strum_macros::{Display, EnumString};

// Largest magnitude that still fits an i64 after rounding; 2^63 itself does not.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Tie-break rule used when snapping a displacement to a whole pixel.
///
/// `HalfEven` is the default and matches `numpy.round`: 0.5 -> 0, 1.5 -> 2,
/// 2.5 -> 2, -0.5 -> 0. `HalfAwayFromZero` matches `f64::round`:
/// 0.5 -> 1, 2.5 -> 3, -0.5 -> -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Rounding {
    #[strum(serialize = "half-even")]
    HalfEven,
    #[strum(serialize = "half-away")]
    HalfAwayFromZero,
}

impl Default for Rounding {
    fn default() -> Self {
        Rounding::HalfEven
    }
}

impl Rounding {
    pub fn round(self, value: f64) -> f64 {
        match self {
            Rounding::HalfEven => value.round_ties_even(),
            Rounding::HalfAwayFromZero => value.round(),
        }
    }

    /// Rounds `value` and converts it to an integer offset.
    ///
    /// Returns `None` for NaN, infinities and values outside the `i64` range.
    pub fn to_offset(self, value: f64) -> Option<i64> {
        if !value.is_finite() {
            return None;
        }
        let rounded = self.round(value);
        if rounded >= I64_BOUND || rounded < -I64_BOUND {
            return None;
        }
        Some(rounded as i64)
    }
}
