//! Ordinary least squares via QR decomposition.
//!
//! Serves as the fixed-effects-only reference: a mixed model with the
//! between-group variance pinned at zero must reproduce these estimates
//! and the sequential sums of squares below.

use crate::data::DesignMatrix;
use crate::error::{LmmError, Result};
use crate::model::rank::independent_columns;
use crate::test::f_test_p_value;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Results from an OLS fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmFit {
    /// Coefficient names from the design matrix.
    pub coefficient_names: Vec<String>,
    /// Estimated coefficients (`NaN` for aliased columns).
    pub coefficients: Vec<f64>,
    /// Standard errors of coefficients (`NaN` for aliased columns).
    pub std_errors: Vec<f64>,
    /// Whether each column was dropped as linearly dependent.
    pub aliased: Vec<bool>,
    /// Residuals.
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// Fitted values.
    #[serde(skip)]
    pub fitted: Vec<f64>,
    /// Residual sum of squares.
    pub rss: f64,
    /// Residual standard error (sigma).
    pub sigma: f64,
    /// R-squared.
    pub r_squared: f64,
    /// Degrees of freedom (residual).
    pub df_residual: usize,
    /// Rank of the design matrix.
    pub rank: usize,
    /// Orthogonal effects Q'y, one per retained column.
    effects: Vec<f64>,
    /// Term index of each retained column.
    effect_terms: Vec<Option<usize>>,
    term_names: Vec<String>,
}

/// One row of an OLS sequential ANOVA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialRow {
    pub term: String,
    pub df: usize,
    pub sum_sq: f64,
    pub mean_sq: f64,
    pub f_value: f64,
    pub p_value: f64,
}

impl LmFit {
    /// Get coefficient index by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Get a coefficient by name.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_index(name).map(|i| self.coefficients[i])
    }

    /// Calculate t-statistic for a coefficient.
    pub fn t_statistic(&self, index: usize) -> Option<f64> {
        let coef = self.coefficients.get(index)?;
        let se = self.std_errors.get(index)?;
        if *se > 0.0 {
            Some(coef / se)
        } else {
            None
        }
    }

    /// Sequential (Type I) sums of squares, one row per term.
    ///
    /// Each term's sum of squares is the squared length of its block of
    /// orthogonal effects, i.e. the drop in RSS when the term is added
    /// after everything listed before it.
    pub fn sequential_anova(&self) -> Vec<SequentialRow> {
        let mse = self.sigma * self.sigma;
        self.term_names
            .iter()
            .enumerate()
            .map(|(t, name)| {
                let block: Vec<f64> = self
                    .effects
                    .iter()
                    .zip(&self.effect_terms)
                    .filter(|(_, a)| **a == Some(t))
                    .map(|(e, _)| *e)
                    .collect();
                let df = block.len();
                let sum_sq: f64 = block.iter().map(|e| e * e).sum();
                let (mean_sq, f_value) = if df > 0 {
                    let ms = sum_sq / df as f64;
                    (ms, ms / mse)
                } else {
                    (f64::NAN, f64::NAN)
                };
                SequentialRow {
                    term: name.clone(),
                    df,
                    sum_sq,
                    mean_sq,
                    f_value,
                    p_value: f_test_p_value(f_value, df as f64, self.df_residual as f64),
                }
            })
            .collect()
    }
}

/// Fit a linear model by least squares.
///
/// Linearly dependent columns are removed first (later columns lose) and
/// reported as aliased. Uses QR decomposition of the retained columns.
pub fn model_lm(y: &[f64], design: &DesignMatrix, rank_tol: f64) -> Result<LmFit> {
    let n = y.len();
    if design.n_observations() != n {
        return Err(LmmError::MalformedDesign(format!(
            "Design has {} rows but response has {} values",
            design.n_observations(),
            n
        )));
    }

    let selection = independent_columns(design.matrix(), rank_tol);
    let rank = selection.rank();
    if n <= rank {
        return Err(LmmError::InsufficientData(format!(
            "Model is saturated ({} observations, rank {})",
            n, rank
        )));
    }
    let df_residual = n - rank;

    let x = design.select_columns(&selection.kept);
    let y_vec = DVector::from_column_slice(y);

    let qr = x.clone().qr();
    let q = qr.q();
    let r = qr.r();

    let effects = q.transpose() * &y_vec;
    let beta = r
        .solve_upper_triangular(&effects)
        .ok_or_else(|| LmmError::Numerical("Triangular solve failed in OLS".to_string()))?;
    let r_inv = r
        .solve_upper_triangular(&DMatrix::identity(rank, rank))
        .ok_or_else(|| LmmError::Numerical("Cannot invert R factor".to_string()))?;

    let fitted_vec = &x * &beta;
    let residuals_vec = &y_vec - &fitted_vec;
    let rss = residuals_vec.norm_squared();
    let sigma = (rss / df_residual as f64).sqrt();

    let p = design.n_coefficients();
    let mut coefficients = vec![f64::NAN; p];
    let mut std_errors = vec![f64::NAN; p];
    let mut aliased = vec![true; p];
    for (k, &j) in selection.kept.iter().enumerate() {
        coefficients[j] = beta[k];
        // diag((X'X)^-1) = row norms of R^-1
        std_errors[j] = sigma * r_inv.row(k).norm();
        aliased[j] = false;
    }

    let y_mean = y.iter().sum::<f64>() / n as f64;
    let tss: f64 = y.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    Ok(LmFit {
        coefficient_names: design.coefficient_names().to_vec(),
        coefficients,
        std_errors,
        aliased,
        residuals: residuals_vec.iter().copied().collect(),
        fitted: fitted_vec.iter().copied().collect(),
        rss,
        sigma,
        r_squared,
        df_residual,
        rank,
        effects: effects.iter().copied().collect(),
        effect_terms: selection.kept.iter().map(|&j| design.assign()[j]).collect(),
        term_names: design.term_names().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Coding, Dataset, DesignSpecification, Observation};
    use approx::assert_relative_eq;

    fn create_test_dataset() -> Dataset {
        let rows = [
            (1.0, "control", 25.0, 1.0),
            (3.0, "treatment", 30.0, 2.0),
            (1.2, "control", 35.0, 3.0),
            (2.8, "treatment", 28.0, 4.0),
            (0.9, "control", 32.0, 5.0),
            (3.1, "treatment", 27.0, 6.0),
        ];
        let obs = rows
            .iter()
            .map(|&(y, g, age, x)| {
                Observation::new(y)
                    .with_categorical("group", g)
                    .with_continuous("age", age)
                    .with_continuous("x", x)
            })
            .collect();
        Dataset::from_observations("y", obs).unwrap()
    }

    fn fit(spec: &str) -> LmFit {
        let data = create_test_dataset();
        let spec = DesignSpecification::parse(spec).unwrap();
        let design = DesignMatrix::from_specification(&data, &spec, Coding::ReferenceLast).unwrap();
        model_lm(&data.response(), &design, 1e-7).unwrap()
    }

    #[test]
    fn test_model_lm_coefficients() {
        let fit = fit("~ group");

        // Reference level is treatment (last); control mean 1.0333, treatment mean 2.9667
        assert_eq!(fit.coefficient_names, vec!["(Intercept)", "groupcontrol"]);
        assert_relative_eq!(fit.coefficients[0], 8.9 / 3.0, epsilon = 1e-10);
        assert_relative_eq!(fit.coefficients[1], 3.1 / 3.0 - 8.9 / 3.0, epsilon = 1e-10);
        assert!(fit.r_squared > 0.9);
    }

    #[test]
    fn test_model_lm_degrees_of_freedom() {
        let fit = fit("~ group + age");
        assert_eq!(fit.df_residual, 3);
        assert_eq!(fit.rank, 3);
    }

    #[test]
    fn test_sequential_anova_sums_to_model_ss() {
        let fit = fit("~ group + age");
        let rows = fit.sequential_anova();
        assert_eq!(rows.len(), 2);

        let y = create_test_dataset().response();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let tss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
        let model_ss: f64 = rows.iter().map(|r| r.sum_sq).sum();
        assert_relative_eq!(model_ss + fit.rss, tss, epsilon = 1e-10);
    }

    #[test]
    fn test_aliased_column() {
        let fit = fit("~ x + I(x^2) + group");
        assert!(!fit.aliased.iter().any(|&a| a));

        let data = create_test_dataset();
        let obs: Vec<Observation> = data
            .observations()
            .iter()
            .map(|o| {
                let x = o.get("x").and_then(|v| v.as_continuous()).unwrap();
                o.clone().with_continuous("x2", 2.0 * x)
            })
            .collect();
        let data = Dataset::from_observations("y", obs).unwrap();
        let spec = DesignSpecification::parse("~ x + x2").unwrap();
        let design = DesignMatrix::from_specification(&data, &spec, Coding::Sum).unwrap();
        let fit = model_lm(&data.response(), &design, 1e-7).unwrap();

        assert_eq!(fit.aliased, vec![false, false, true]);
        assert!(fit.coefficients[2].is_nan());
        assert_eq!(fit.sequential_anova()[1].df, 0);
    }

    #[test]
    fn test_saturated_model() {
        let data = create_test_dataset();
        let spec = DesignSpecification::parse("~ factor(x)").unwrap();
        let design = DesignMatrix::from_specification(&data, &spec, Coding::Sum).unwrap();
        let err = model_lm(&data.response(), &design, 1e-7).unwrap_err();
        assert!(matches!(err, LmmError::InsufficientData(_)));
    }
}
