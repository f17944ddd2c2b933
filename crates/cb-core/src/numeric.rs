//! Numeric guards and approximate comparison.
//!
//! Instrument readings and operator settings both arrive as bare `f64`: a
//! glitched status read can carry NaN, and a hand-edited settings file can
//! carry anything at all. Configuration validation funnels every numeric
//! check through the guards here, so a bad value is rejected with the same
//! typed error no matter which crate caught it.

use crate::error::{CbError, CbResult};

/// Reject NaN and infinities, passing finite values through.
pub fn ensure_finite(value: f64, what: &'static str) -> CbResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CbError::NonFinite { what, value })
    }
}

/// Reject anything but a finite value strictly greater than zero.
pub fn ensure_positive(value: f64, what: &'static str) -> CbResult<f64> {
    let value = ensure_finite(value, what)?;
    if value > 0.0 {
        Ok(value)
    } else {
        Err(CbError::NotPositive { what, value })
    }
}

/// Reject anything but a finite value of zero or more.
pub fn ensure_non_negative(value: f64, what: &'static str) -> CbResult<f64> {
    let value = ensure_finite(value, what)?;
    if value >= 0.0 {
        Ok(value)
    } else {
        Err(CbError::Negative { what, value })
    }
}

/// Absolute/relative tolerance pair for approximate comparison.
///
/// Defaults are sized for instrument-scale magnitudes (volts, amps,
/// percent), where anything below a microunit is measurement noise.
#[derive(Clone, Copy, Debug)]
pub struct Tolerances {
    pub abs: f64,
    pub rel: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            abs: 1e-9,
            rel: 1e-6,
        }
    }
}

/// True when `a` and `b` agree within `tol`: the absolute band applies near
/// zero, the relative band scales with the larger magnitude.
pub fn nearly_equal(a: f64, b: f64, tol: Tolerances) -> bool {
    let diff = (a - b).abs();
    diff <= tol.abs || diff <= tol.rel * a.abs().max(b.abs())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn guards_return_the_checked_value() {
        assert_eq!(ensure_finite(4.2, "v").unwrap(), 4.2);
        assert_eq!(ensure_positive(0.05, "i").unwrap(), 0.05);
        assert_eq!(ensure_non_negative(0.0, "threshold").unwrap(), 0.0);
    }

    #[test]
    fn zero_is_non_negative_but_not_positive() {
        assert!(matches!(
            ensure_positive(0.0, "current"),
            Err(CbError::NotPositive { .. })
        ));
        assert!(ensure_non_negative(0.0, "current").is_ok());
    }

    #[test]
    fn non_finite_values_fail_every_guard_by_name() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = ensure_positive(bad, "loop timeout").unwrap_err();
            assert!(matches!(err, CbError::NonFinite { .. }));
            assert!(format!("{err}").contains("loop timeout"));
        }
    }

    #[test]
    fn negative_values_name_the_violated_rule() {
        let err = ensure_non_negative(-0.1, "settle time").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("settle time"));
        assert!(msg.contains("non-negative"));
    }

    #[test]
    fn nearly_equal_bands() {
        let tol = Tolerances::default();
        // Absolute band near zero, relative band at scale.
        assert!(nearly_equal(0.0, 5e-10, tol));
        assert!(nearly_equal(1e6, 1e6 + 0.5, tol));
        assert!(!nearly_equal(4.2, 4.21, tol));
    }

    proptest! {
        #[test]
        fn comparison_is_symmetric(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let tol = Tolerances::default();
            prop_assert_eq!(nearly_equal(a, b, tol), nearly_equal(b, a, tol));
        }

        #[test]
        fn every_value_equals_itself(a in -1e12f64..1e12) {
            prop_assert!(nearly_equal(a, a, Tolerances::default()));
        }

        #[test]
        fn positive_guard_agrees_with_the_sign(a in -1e9f64..1e9) {
            prop_assert_eq!(ensure_positive(a, "x").is_ok(), a > 0.0);
        }
    }
}
