//! Sequential (Type I) ANOVA for the fixed effects.
//!
//! With `X'V⁻¹X = LL'` (Cholesky, columns in specification order) the
//! effects `e = L'β̂` are independent with unit variance, and the
//! V-weighted sum of squares a term adds after all earlier terms is the
//! sum of its squared effects. The rows of `L'` belonging to a term are
//! also the whitened contrast used for its denominator df.

use crate::error::Result;
use crate::test::f_test_p_value;
use crate::test::satterthwaite::SatterthwaiteInputs;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

/// One term of the sequential ANOVA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnovaRow {
    /// Term name, e.g. `A:C`.
    pub term: String,
    /// Numerator df: columns the term adds after rank reduction.
    pub num_df: usize,
    /// Sum of squares on the response scale (weighted SS × σ²_e).
    pub sum_sq: f64,
    /// `sum_sq / num_df`.
    pub mean_sq: f64,
    pub f_value: f64,
    /// Satterthwaite denominator df.
    pub den_df: f64,
    pub p_value: f64,
}

/// Sequential ANOVA table, one row per term in specification order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnovaTable {
    pub rows: Vec<AnovaRow>,
}

impl AnovaTable {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for a term by name.
    pub fn row(&self, term: &str) -> Option<&AnovaRow> {
        self.rows.iter().find(|r| r.term == term)
    }

    /// P-values in row order.
    pub fn p_values(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.p_value).collect()
    }

    /// Write the table as tab-separated values.
    pub fn write_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "term\tnum_df\tsum_sq\tmean_sq\tf_value\tden_df\tp_value")?;
        for r in &self.rows {
            writeln!(
                file,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.term, r.num_df, r.sum_sq, r.mean_sq, r.f_value, r.den_df, r.p_value
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for AnovaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|r| r.term.len())
            .max()
            .unwrap_or(4)
            .max(4);
        writeln!(
            f,
            "{:<width$} {:>6} {:>12} {:>12} {:>10} {:>9} {:>10}",
            "Term", "NumDF", "Sum Sq", "Mean Sq", "F value", "DenDF", "Pr(>F)"
        )?;
        for r in &self.rows {
            writeln!(
                f,
                "{:<width$} {:>6} {:>12.5} {:>12.5} {:>10.4} {:>9.3} {:>10.4e}",
                r.term, r.num_df, r.sum_sq, r.mean_sq, r.f_value, r.den_df, r.p_value
            )?;
        }
        Ok(())
    }
}

/// Build the sequential ANOVA.
///
/// `chol_lower` is the Cholesky factor of `X'V⁻¹X` over the retained
/// columns, `effect_terms` the term index of each retained column.
pub(crate) fn sequential_anova(
    term_names: &[String],
    effect_terms: &[Option<usize>],
    chol_lower: &DMatrix<f64>,
    beta: &DVector<f64>,
    residual_variance: f64,
    inputs: &SatterthwaiteInputs,
) -> AnovaTable {
    let upper = chol_lower.transpose();
    let effects = &upper * beta;

    let rows = term_names
        .iter()
        .enumerate()
        .map(|(t, name)| {
            let positions: Vec<usize> = effect_terms
                .iter()
                .enumerate()
                .filter(|(_, a)| **a == Some(t))
                .map(|(k, _)| k)
                .collect();
            let num_df = positions.len();

            if num_df == 0 {
                return AnovaRow {
                    term: name.clone(),
                    num_df: 0,
                    sum_sq: f64::NAN,
                    mean_sq: f64::NAN,
                    f_value: f64::NAN,
                    den_df: f64::NAN,
                    p_value: f64::NAN,
                };
            }

            let weighted: f64 = positions.iter().map(|&k| effects[k] * effects[k]).sum();
            let f_value = weighted / num_df as f64;
            let contrast = upper.select_rows(positions.iter());
            let den_df = inputs.contrast_matrix_ddf(&contrast);
            let sum_sq = weighted * residual_variance;

            AnovaRow {
                term: name.clone(),
                num_df,
                sum_sq,
                mean_sq: sum_sq / num_df as f64,
                f_value,
                den_df,
                p_value: f_test_p_value(f_value, num_df as f64, den_df),
            }
        })
        .collect();

    AnovaTable { rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix2;

    /// OLS with σ² = 1 on an orthogonal design: X'X = diag(4, 4, 4).
    fn orthogonal_case() -> (DMatrix<f64>, SatterthwaiteInputs) {
        let info = DMatrix::from_diagonal_element(3, 3, 4.0);
        let covariance = DMatrix::from_diagonal_element(3, 3, 0.25);
        let inputs = SatterthwaiteInputs {
            covariance,
            derivatives: [DMatrix::zeros(3, 3), info.clone()],
            theta_covariance: Matrix2::new(0.0, 0.0, 0.0, 2.0 / 5.0),
        };
        (info, inputs)
    }

    #[test]
    fn test_orthogonal_terms() {
        let (info, inputs) = orthogonal_case();
        let chol = info.cholesky().unwrap().l();
        let beta = DVector::from_vec(vec![10.0, 1.0, 0.5]);
        let names = vec!["a".to_string(), "b".to_string()];
        let terms = vec![None, Some(0), Some(1)];

        let table = sequential_anova(&names, &terms, &chol, &beta, 1.0, &inputs);

        assert_eq!(table.len(), 2);
        let a = table.row("a").unwrap();
        assert_eq!(a.num_df, 1);
        assert_relative_eq!(a.sum_sq, 4.0, epsilon = 1e-12);
        assert_relative_eq!(a.f_value, 4.0, epsilon = 1e-12);
        assert_relative_eq!(a.den_df, 5.0, max_relative = 1e-10);
        assert_relative_eq!(table.row("b").unwrap().sum_sq, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_term_without_columns() {
        let (info, inputs) = orthogonal_case();
        let chol = info.cholesky().unwrap().l();
        let beta = DVector::from_vec(vec![10.0, 1.0, 0.5]);
        let names = vec!["a".to_string(), "b".to_string(), "factor(a)".to_string()];
        let terms = vec![None, Some(0), Some(1)];

        let table = sequential_anova(&names, &terms, &chol, &beta, 1.0, &inputs);
        let row = table.row("factor(a)").unwrap();
        assert_eq!(row.num_df, 0);
        assert!(row.f_value.is_nan());
        assert!(row.p_value.is_nan());
    }

    #[test]
    fn test_display_and_tsv() {
        let (info, inputs) = orthogonal_case();
        let chol = info.cholesky().unwrap().l();
        let beta = DVector::from_vec(vec![10.0, 1.0, 0.5]);
        let names = vec!["a".to_string(), "b".to_string()];
        let table = sequential_anova(&names, &[None, Some(0), Some(1)], &chol, &beta, 1.0, &inputs);

        let text = table.to_string();
        assert!(text.starts_with("Term"));
        assert!(text.contains("DenDF"));

        let file = tempfile::NamedTempFile::new().unwrap();
        table.write_tsv(file.path()).unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("a\t1\t"));
    }
}
