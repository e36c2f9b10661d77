//! Mass conservation checks across resampling

use ndarray::ArrayD;
use serde::Serialize;
use tracing::warn;

/// Relative error above which a resampled field is reported.
pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// Sum over finite values, accumulated in f64. NaN contributes nothing.
#[must_use]
pub fn finite_sum(data: &ArrayD<f32>) -> f64 {
    data.iter()
        .filter(|v| v.is_finite())
        .map(|&v| f64::from(v))
        .sum()
}

/// `|Σresampled − Σoriginal| / |Σoriginal|`.
///
/// A zero original total gives 0 when the resampled total is zero too and
/// infinity otherwise.
#[must_use]
pub fn relative_error(original: &ArrayD<f32>, resampled: &ArrayD<f32>) -> f64 {
    let before = finite_sum(original);
    let after = finite_sum(resampled);
    if before == 0.0 {
        if after == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (after - before).abs() / before.abs()
    }
}

/// Result of one conservation check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MassCheck {
    pub field: String,
    pub original_total: f64,
    pub resampled_total: f64,
    pub rel_error: f64,
    pub tolerance: f64,
    /// Error above tolerance; a warning, never a failure
    pub exceeds: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MassConservationValidator {
    tolerance: f64,
}

impl Default for MassConservationValidator {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl MassConservationValidator {
    #[must_use]
    pub const fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    #[must_use]
    pub const fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn validate(&self, field: &str, original: &ArrayD<f32>, resampled: &ArrayD<f32>) -> MassCheck {
        let original_total = finite_sum(original);
        let resampled_total = finite_sum(resampled);
        let rel_error = relative_error(original, resampled);
        let exceeds = rel_error > self.tolerance;
        if exceeds {
            warn!(
                field,
                original_total,
                resampled_total,
                rel_error,
                tolerance = self.tolerance,
                "Mass not conserved within tolerance"
            );
        }
        MassCheck {
            field: field.to_string(),
            original_total,
            resampled_total,
            rel_error,
            tolerance: self.tolerance,
            exceeds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn untouched_field_has_zero_error() {
        let a = arr2(&[[1.0f32, 2.0], [f32::NAN, 4.0]]).into_dyn();
        let check = MassConservationValidator::default().validate("pm25", &a, &a.clone());
        assert_eq!(check.rel_error, 0.0);
        assert!(!check.exceeds);
        assert_relative_eq!(check.original_total, 7.0);
    }

    #[test]
    fn loss_above_tolerance_is_flagged() {
        let a = arr2(&[[10.0f32, 10.0]]).into_dyn();
        let b = arr2(&[[9.0f32, f32::NAN]]).into_dyn();
        let check = MassConservationValidator::new(0.05).validate("frp", &a, &b);
        assert_relative_eq!(check.rel_error, 0.55);
        assert!(check.exceeds);
    }

    #[test]
    fn zero_totals() {
        let zero = arr2(&[[0.0f32, f32::NAN]]).into_dyn();
        let some = arr2(&[[0.5f32, 0.0]]).into_dyn();
        assert_eq!(relative_error(&zero, &zero), 0.0);
        assert!(relative_error(&zero, &some).is_infinite());
    }
}
