//! Hypothesis tests for fitted split-plot models.

pub mod anova;

pub use anova::{AnovaRow, AnovaTable};
pub use satterthwaite::{combine_ddf, SatterthwaiteInputs};
pub use wald::CoefficientTest;

use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal, StudentsT};

/// Two-sided p-value for a t statistic.
///
/// Infinite degrees of freedom fall back to the standard normal.
pub fn t_test_p_value(t: f64, df: f64) -> f64 {
    if !t.is_finite() || df.is_nan() || df <= 0.0 {
        return f64::NAN;
    }
    let upper = if df.is_infinite() {
        match Normal::new(0.0, 1.0) {
            Ok(dist) => dist.sf(t.abs()),
            Err(_) => return f64::NAN,
        }
    } else {
        match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => dist.sf(t.abs()),
            Err(_) => return f64::NAN,
        }
    };
    (2.0 * upper).min(1.0)
}

/// Upper-tail p-value for an F statistic.
///
/// An infinite denominator df uses the chi-squared limit of `num_df * F`.
pub fn f_test_p_value(f: f64, num_df: f64, den_df: f64) -> f64 {
    if !f.is_finite() || f < 0.0 || !(num_df > 0.0) || den_df.is_nan() || den_df <= 0.0 {
        return f64::NAN;
    }
    if den_df.is_infinite() {
        return ChiSquared::new(num_df)
            .map(|dist| dist.sf(f * num_df))
            .unwrap_or(f64::NAN);
    }
    FisherSnedecor::new(num_df, den_df)
        .map(|dist| dist.sf(f))
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_t_p_value_known() {
        // t = 2.228 with 10 df is the 97.5% quantile
        assert_relative_eq!(t_test_p_value(2.228_138_85, 10.0), 0.05, epsilon = 1e-6);
        assert_relative_eq!(t_test_p_value(0.0, 5.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_t_p_value_infinite_df() {
        assert_relative_eq!(t_test_p_value(1.959_963_985, f64::INFINITY), 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_f_p_value_matches_t_squared() {
        let t: f64 = 1.7;
        assert_relative_eq!(
            f_test_p_value(t * t, 1.0, 12.0),
            t_test_p_value(t, 12.0),
            epsilon = 1e-8
        );
    }

    #[test]
    fn test_invalid_inputs_give_nan() {
        assert!(t_test_p_value(f64::NAN, 3.0).is_nan());
        assert!(f_test_p_value(1.0, 0.0, 3.0).is_nan());
        assert!(f_test_p_value(1.0, 2.0, 0.0).is_nan());
    }
}
