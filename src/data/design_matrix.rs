//! Fixed-effect design matrix construction from a dataset and specification.

use crate::data::{Dataset, DesignSpecification, Factor, Transform, Variable, VariableType};
use crate::error::{LmmError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Contrast coding for categorical factors.
///
/// Both codings drop the last level (in sorted order) wherever a factor
/// is coded by contrasts, so they span the same column space: fitted
/// values and tests agree, individual coefficients do not. A factor whose
/// margin is absent from the earlier terms gets all of its levels under
/// either coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coding {
    /// Sum-to-zero: level `j` is `1` at `j`, `-1` at the last level.
    #[default]
    Sum,
    /// Treatment coding with the last level as reference.
    ReferenceLast,
}

impl Coding {
    pub fn name(&self) -> &'static str {
        match self {
            Coding::Sum => "sum-to-zero",
            Coding::ReferenceLast => "reference = last level",
        }
    }
}

impl std::str::FromStr for Coding {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" | "sum_to_zero" | "sum-to-zero" | "effect" => Ok(Coding::Sum),
            "reference_last" | "reference-last" | "reference" | "sas" => Ok(Coding::ReferenceLast),
            other => Err(LmmError::InvalidParameter(format!(
                "Unknown coding '{}'; expected 'sum' or 'reference-last'",
                other
            ))),
        }
    }
}

/// A design matrix for the fixed effects.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// The design matrix (observations × coefficients).
    matrix: DMatrix<f64>,
    /// Names of the coefficients (columns).
    coefficient_names: Vec<String>,
    /// Term index of each column, `None` for the intercept.
    assign: Vec<Option<usize>>,
    /// Display names of the terms, in specification order.
    term_names: Vec<String>,
    coding: Coding,
}

type NamedColumn = (String, Vec<f64>);

impl DesignMatrix {
    /// Build the design matrix by evaluating each term in order.
    pub fn from_specification(
        dataset: &Dataset,
        spec: &DesignSpecification,
        coding: Coding,
    ) -> Result<Self> {
        let n = dataset.n_observations();

        for var in spec.variables() {
            if !dataset.has_column(var) {
                return Err(LmmError::MalformedDesign(format!(
                    "Covariate '{}' not found in dataset",
                    var
                )));
            }
        }

        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut assign = Vec::new();

        if spec.intercept {
            coefficient_names.push("(Intercept)".to_string());
            columns.push(vec![1.0; n]);
            assign.push(None);
        }

        // A categorical factor gets all of its levels when the term without
        // it has not appeared earlier. The empty term is present with an
        // intercept, or once a main effect has been coded in full.
        let mut empty_present = spec.intercept;
        let mut seen: Vec<BTreeSet<&Factor>> = Vec::new();

        for (term_idx, term) in spec.terms.iter().enumerate() {
            let mut term_columns: Vec<NamedColumn> = vec![(String::new(), vec![1.0; n])];

            for (k, factor) in term.factors.iter().enumerate() {
                let full = is_categorical(dataset, factor) && {
                    let margin: BTreeSet<&Factor> = term
                        .factors
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != k)
                        .map(|(_, f)| f)
                        .collect();
                    if margin.is_empty() {
                        !empty_present
                    } else {
                        !seen.contains(&margin)
                    }
                };
                if full && term.factors.len() == 1 {
                    empty_present = true;
                }
                let factor_columns = factor_columns(dataset, factor, coding, full)?;

                let mut product = Vec::with_capacity(term_columns.len() * factor_columns.len());
                for (name1, col1) in &term_columns {
                    for (name2, col2) in &factor_columns {
                        let name = if name1.is_empty() {
                            name2.clone()
                        } else {
                            format!("{}:{}", name1, name2)
                        };
                        let col: Vec<f64> = col1.iter().zip(col2).map(|(a, b)| a * b).collect();
                        product.push((name, col));
                    }
                }
                term_columns = product;
            }

            for (name, col) in term_columns {
                coefficient_names.push(name);
                columns.push(col);
                assign.push(Some(term_idx));
            }
            seen.push(term.factors.iter().collect());
        }

        let mut matrix = DMatrix::zeros(n, columns.len());
        for (col_idx, col) in columns.iter().enumerate() {
            for (row_idx, &val) in col.iter().enumerate() {
                matrix[(row_idx, col_idx)] = val;
            }
        }

        Ok(Self {
            matrix,
            coefficient_names,
            assign,
            term_names: spec.terms.iter().map(|t| t.to_string()).collect(),
            coding,
        })
    }

    /// Get the design matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Get coefficient names.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Term index of each column (`None` for the intercept).
    pub fn assign(&self) -> &[Option<usize>] {
        &self.assign
    }

    /// Term names in specification order.
    pub fn term_names(&self) -> &[String] {
        &self.term_names
    }

    /// Coding used for categorical factors.
    pub fn coding(&self) -> Coding {
        self.coding
    }

    /// Number of observations (rows).
    pub fn n_observations(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Columns contributed by a term.
    pub fn columns_for_term(&self, term: usize) -> Vec<usize> {
        self.assign
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == Some(term))
            .map(|(i, _)| i)
            .collect()
    }

    /// Get the index of a coefficient by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Check if the matrix has an intercept.
    pub fn has_intercept(&self) -> bool {
        self.assign.first() == Some(&None)
    }

    /// Sub-matrix with the given columns, in the given order.
    pub fn select_columns(&self, columns: &[usize]) -> DMatrix<f64> {
        self.matrix.select_columns(columns.iter())
    }
}

fn is_categorical(dataset: &Dataset, factor: &Factor) -> bool {
    match factor.transform {
        Transform::Indicator => true,
        Transform::Square => false,
        Transform::Identity => dataset.column_type(&factor.variable) == Some(VariableType::Categorical),
    }
}

/// Columns for one factor of a term.
fn factor_columns(
    dataset: &Dataset,
    factor: &Factor,
    coding: Coding,
    full: bool,
) -> Result<Vec<NamedColumn>> {
    let name = &factor.variable;
    let values = dataset.column(name)?;

    if let Some(row) = values.iter().position(|v| v.is_missing()) {
        return Err(LmmError::MalformedDesign(format!(
            "Observation {} has no value for covariate '{}'",
            row, name
        )));
    }

    if !is_categorical(dataset, factor) {
        let numeric: Vec<f64> = values
            .iter()
            .map(|v| match v {
                Variable::Continuous(x) => Ok(*x),
                _ => Err(LmmError::MalformedDesign(format!(
                    "Transform {} needs a numeric covariate, '{}' is categorical",
                    factor, name
                ))),
            })
            .collect::<Result<_>>()?;
        let col = match factor.transform {
            Transform::Square => numeric.iter().map(|x| x * x).collect(),
            _ => numeric,
        };
        return Ok(vec![(factor.to_string(), col)]);
    }

    let levels = dataset.levels(name)?;
    let labels: Vec<String> = values.iter().filter_map(|v| v.label()).collect();
    let prefix = match factor.transform {
        Transform::Indicator => factor.to_string(),
        _ => name.clone(),
    };

    let indicator = |level: &str| -> Vec<f64> {
        labels
            .iter()
            .map(|l| if l == level { 1.0 } else { 0.0 })
            .collect()
    };

    if full {
        return Ok(levels
            .iter()
            .map(|level| (format!("{}{}", prefix, level), indicator(level)))
            .collect());
    }

    let Some((last, kept)) = levels.split_last() else {
        return Ok(Vec::new());
    };
    let last_col = indicator(last);

    Ok(kept
        .iter()
        .map(|level| {
            let mut col = indicator(level);
            if coding == Coding::Sum {
                for (c, l) in col.iter_mut().zip(&last_col) {
                    *c -= l;
                }
            }
            (format!("{}{}", prefix, level), col)
        })
        .collect())
}
