//! Linear mixed model with a single random intercept.
//!
//! Fits `y = Xβ + Zu + ε` where `u ~ N(0, σ²_g I)` is one intercept per
//! whole plot and `ε ~ N(0, σ²_e I)`, so that
//! `V = σ²_g ZZ' + σ²_e I`.
//!
//! Variance components are estimated by REML, fixed effects by GLS on the
//! rank-reduced design, and inference uses a sequential (Type I) ANOVA
//! and per-coefficient t-tests with Satterthwaite degrees of freedom.
//!
//! # Example
//! ```no_run
//! use splitplot_lmm::data::Dataset;
//! use splitplot_lmm::model::lmm::{fit_formula, LmmConfig};
//!
//! let data = Dataset::from_path("splitplot.csv", "y").unwrap();
//! let model = fit_formula(
//!     &data,
//!     "y ~ A + B + I(A^2) + I(B^2) + A:B + C + (1 | rep:A:B)",
//!     &LmmConfig::default(),
//! )
//! .unwrap();
//! println!("{}", model);
//! ```

use crate::data::{
    Coding, Dataset, DesignMatrix, DesignSpecification, GroupingKey, MixedFormula,
    RandomDesignMatrix,
};
use crate::error::{LmmError, Result};
use crate::model::rank::independent_columns;
use crate::model::reml::{estimate, moment_seed, RemlControl, VarianceComponents};
use crate::test::anova::sequential_anova;
use crate::test::wald::test_coefficients;
use crate::test::{AnovaTable, CoefficientTest, SatterthwaiteInputs};
use nalgebra::{DMatrix, DVector, Matrix2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Configuration for mixed model fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmmConfig {
    /// Maximum Fisher-scoring iterations.
    pub max_iter: usize,
    /// Relative change in both variance components that counts as converged.
    pub tol: f64,
    /// Lower bound for the residual variance.
    pub var_lower_bound: f64,
    /// Relative residual norm below which a design column is dependent.
    pub rank_tol: f64,
    /// Contrast coding for categorical factors.
    pub coding: Coding,
    /// Maximum number of dependent columns to drop before failing.
    /// `None` tolerates any number (each drop is still reported).
    pub max_dropped_columns: Option<usize>,
    /// Pin σ²_g to this value and estimate σ²_e only.
    pub fixed_between_variance: Option<f64>,
}

impl Default for LmmConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-8,
            var_lower_bound: 1e-10,
            rank_tol: 1e-7,
            coding: Coding::Sum,
            max_dropped_columns: None,
            fixed_between_variance: None,
        }
    }
}

impl LmmConfig {
    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.tol > 0.0) {
            return Err(LmmError::InvalidParameter(format!(
                "tol must be positive, got {}",
                self.tol
            )));
        }
        if !(self.var_lower_bound > 0.0) {
            return Err(LmmError::InvalidParameter(format!(
                "var_lower_bound must be positive, got {}",
                self.var_lower_bound
            )));
        }
        if !(self.rank_tol > 0.0 && self.rank_tol < 1.0) {
            return Err(LmmError::InvalidParameter(format!(
                "rank_tol must be in (0, 1), got {}",
                self.rank_tol
            )));
        }
        if let Some(v) = self.fixed_between_variance {
            if !v.is_finite() || v < 0.0 {
                return Err(LmmError::InvalidParameter(format!(
                    "fixed_between_variance must be finite and non-negative, got {}",
                    v
                )));
            }
        }
        Ok(())
    }

    /// Fixed-effects-only fit: σ²_g pinned at zero.
    pub fn ordinary_least_squares() -> Self {
        Self {
            fixed_between_variance: Some(0.0),
            ..Self::default()
        }
    }
}

/// Non-fatal conditions recorded on a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitWarning {
    /// Design columns dropped as linearly dependent on earlier columns.
    RankDeficient { dropped: Vec<String> },
    /// The between-group variance was estimated on the boundary (zero).
    BoundaryFit { between: f64 },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::RankDeficient { dropped } => write!(
                f,
                "fixed-effect design is rank deficient; dropped {} column(s): {}",
                dropped.len(),
                dropped.join(", ")
            ),
            FitWarning::BoundaryFit { between } => write!(
                f,
                "between-group variance estimated at the boundary ({:.3e})",
                between
            ),
        }
    }
}

/// Predicted random intercept for one whole plot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEffect {
    pub group: String,
    pub n_observations: usize,
    /// BLUP `σ²_g Z'Py` for this group.
    pub blup: f64,
}

/// A fitted split-plot mixed model.
#[derive(Debug, Clone, Serialize)]
pub struct FittedModel {
    /// Fixed and random parts, e.g. `y ~ A + C + (1 | plot)`.
    pub formula: String,
    pub response: String,
    pub grouping: GroupingKey,
    pub coding: Coding,
    /// One entry per design column, aliased columns included.
    pub coefficients: Vec<CoefficientTest>,
    pub variance: VarianceComponents,
    /// Intraclass correlation σ²_g / (σ²_g + σ²_e).
    pub icc: f64,
    pub anova: AnovaTable,
    pub random_effects: Vec<GroupEffect>,
    /// Xβ̂.
    #[serde(skip)]
    pub fitted_marginal: Vec<f64>,
    /// Xβ̂ + Zû.
    #[serde(skip)]
    pub fitted_conditional: Vec<f64>,
    /// y - Xβ̂ - Zû.
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// REML log-likelihood at the estimates.
    pub log_reml: f64,
    /// Fisher-scoring iterations taken.
    pub iterations: usize,
    pub n_observations: usize,
    pub n_groups: usize,
    /// Rank of the fixed-effect design.
    pub rank: usize,
    /// `n - rank`.
    pub df_residual: usize,
    pub warnings: Vec<FitWarning>,
    /// Covariance of the retained coefficients, (X'V⁻¹X)⁻¹.
    #[serde(skip)]
    covariance: DMatrix<f64>,
    /// Design column index of each row of `covariance`.
    #[serde(skip)]
    kept: Vec<usize>,
}

impl FittedModel {
    /// Coefficient test by column name.
    pub fn coefficient(&self, name: &str) -> Option<&CoefficientTest> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    /// Estimate by column name (`NaN` if aliased).
    pub fn estimate(&self, name: &str) -> Option<f64> {
        self.coefficient(name).map(|c| c.estimate)
    }

    /// Coefficient names in design order.
    pub fn coefficient_names(&self) -> Vec<&str> {
        self.coefficients.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of design columns dropped during rank reduction.
    pub fn dropped_columns(&self) -> Vec<&str> {
        self.coefficients
            .iter()
            .filter(|c| c.aliased)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Whether σ²_g was estimated at zero.
    pub fn is_boundary(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, FitWarning::BoundaryFit { .. }))
    }

    /// Covariance between two retained coefficients, by name.
    pub fn covariance(&self, a: &str, b: &str) -> Option<f64> {
        let pos = |name: &str| {
            let j = self.coefficients.iter().position(|c| c.name == name)?;
            self.kept.iter().position(|&k| k == j)
        };
        Some(self.covariance[(pos(a)?, pos(b)?)])
    }

    /// Serialize the model summary to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Coefficient table as tab-separated values.
    pub fn coefficients_tsv(&self) -> String {
        let mut out =
            String::from("coefficient\tterm\testimate\tstd_error\tdf\tt_value\tp_value\taliased\n");
        for c in &self.coefficients {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                c.name,
                c.term.as_deref().unwrap_or(""),
                c.estimate,
                c.std_error,
                c.df,
                c.t_value,
                c.p_value,
                c.aliased
            ));
        }
        out
    }

    /// Write the coefficient table as tab-separated values.
    pub fn write_coefficients_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.coefficients_tsv())?;
        Ok(())
    }

    /// Write fitted values and residuals per observation.
    pub fn write_fitted_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "observation\tfitted_marginal\tfitted_conditional\tresidual")?;
        for i in 0..self.n_observations {
            writeln!(
                file,
                "{}\t{}\t{}\t{}",
                i + 1,
                self.fitted_marginal[i],
                self.fitted_conditional[i],
                self.residuals[i]
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for FittedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Linear mixed model fit by REML")?;
        writeln!(f, "Formula: {}", self.formula)?;
        writeln!(f, "Coding: {}", self.coding.name())?;
        writeln!(
            f,
            "Observations: {}, groups: {}, rank: {}",
            self.n_observations, self.n_groups, self.rank
        )?;
        writeln!(
            f,
            "REML log-likelihood: {:.4} ({} iterations)",
            self.log_reml, self.iterations
        )?;

        writeln!(f)?;
        writeln!(f, "Random effects:")?;
        let group_label = self.grouping.to_string();
        let width = group_label.len().max("Residual".len());
        writeln!(f, "  {:<width$} {:>12} {:>12}", "Groups", "Variance", "Std.Dev.")?;
        writeln!(
            f,
            "  {:<width$} {:>12.6} {:>12.6}",
            group_label,
            self.variance.between,
            self.variance.between.sqrt()
        )?;
        writeln!(
            f,
            "  {:<width$} {:>12.6} {:>12.6}",
            "Residual",
            self.variance.residual,
            self.variance.residual.sqrt()
        )?;
        writeln!(f, "  ICC: {:.4}", self.icc)?;

        writeln!(f)?;
        writeln!(f, "Fixed effects:")?;
        let width = self
            .coefficients
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(4)
            .max(4);
        writeln!(
            f,
            "  {:<width$} {:>12} {:>12} {:>9} {:>9} {:>10}",
            "Name", "Estimate", "Std. Error", "df", "t value", "Pr(>|t|)"
        )?;
        for c in &self.coefficients {
            if c.aliased {
                writeln!(f, "  {:<width$} {:>12}", c.name, "(aliased)")?;
            } else {
                writeln!(
                    f,
                    "  {:<width$} {:>12.6} {:>12.6} {:>9.3} {:>9.3} {:>10.4e}",
                    c.name, c.estimate, c.std_error, c.df, c.t_value, c.p_value
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Type I ANOVA (Satterthwaite df):")?;
        write!(f, "{}", self.anova)?;

        if !self.warnings.is_empty() {
            writeln!(f)?;
            writeln!(f, "Warnings:")?;
            for w in &self.warnings {
                writeln!(f, "  - {}", w)?;
            }
        }
        Ok(())
    }
}

/// Fit the mixed model.
///
/// The design is evaluated in specification order; columns in the span
/// of earlier columns are dropped and reported. σ²_g and σ²_e are
/// estimated by REML, and the returned model carries GLS coefficients,
/// their t-tests, the sequential ANOVA and the random-effect predictions.
///
/// # Errors
/// - `MalformedDesign` for unknown covariates, missing covariate or
///   grouping values, or invalid transforms
/// - `InsufficientData` for fewer than two groups or a saturated design
/// - `RankDeficiency` when more columns are dropped than
///   `max_dropped_columns` allows
/// - `Convergence` when REML does not converge within `max_iter`
pub fn fit(
    dataset: &Dataset,
    spec: &DesignSpecification,
    grouping: &GroupingKey,
    config: &LmmConfig,
) -> Result<FittedModel> {
    config.validate()?;
    if dataset.is_empty() {
        return Err(LmmError::InsufficientData(
            "Dataset has no observations".to_string(),
        ));
    }

    let design = DesignMatrix::from_specification(dataset, spec, config.coding)?;
    if design.n_coefficients() == 0 {
        return Err(LmmError::MalformedDesign(
            "Design has no fixed-effect columns".to_string(),
        ));
    }
    let random = RandomDesignMatrix::from_grouping(dataset, grouping)?;

    let n = dataset.n_observations();
    if random.n_groups < 2 {
        return Err(LmmError::InsufficientData(format!(
            "Need at least 2 groups for '{}', found {}",
            grouping, random.n_groups
        )));
    }

    info!(
        n_observations = n,
        n_groups = random.n_groups,
        n_columns = design.n_coefficients(),
        "fitting mixed model {} + (1 | {})",
        spec,
        grouping
    );

    let selection = independent_columns(design.matrix(), config.rank_tol);
    let mut warnings = Vec::new();
    if !selection.dropped.is_empty() {
        let dropped: Vec<String> = selection
            .dropped
            .iter()
            .map(|&j| design.coefficient_names()[j].clone())
            .collect();
        if let Some(allowed) = config.max_dropped_columns {
            if dropped.len() > allowed {
                return Err(LmmError::RankDeficiency { dropped, allowed });
            }
        }
        warn!(dropped = ?dropped, "design is rank deficient, dropping dependent columns");
        warnings.push(FitWarning::RankDeficient { dropped });
    }

    let rank = selection.rank();
    if n <= rank {
        return Err(LmmError::InsufficientData(format!(
            "{} observations cannot support a design of rank {}",
            n, rank
        )));
    }

    let x = design.select_columns(&selection.kept);
    let z = random.matrix();
    let y = DVector::from_vec(dataset.response());

    let control = RemlControl {
        max_iter: config.max_iter,
        tol: config.tol,
        var_lower_bound: config.var_lower_bound,
        fixed_between: config.fixed_between_variance,
    };
    let seed = moment_seed(&y, &x, z, &control, config.rank_tol)?;
    let reml = estimate(&y, &x, z, seed, &control)?;
    let state = &reml.state;
    let variance = state.theta;

    if config.fixed_between_variance.is_none() && variance.between <= config.var_lower_bound {
        warn!(
            between = variance.between,
            "between-group variance estimated at the boundary"
        );
        warnings.push(FitWarning::BoundaryFit {
            between: variance.between,
        });
    }

    let theta_covariance = theta_covariance(&reml.expected_information, config)?;
    let zt_vinv_x = z.transpose() * &state.v_inv_x;
    let inputs = SatterthwaiteInputs {
        covariance: state.covariance.clone(),
        derivatives: [
            zt_vinv_x.transpose() * &zt_vinv_x,
            state.v_inv_x.transpose() * &state.v_inv_x,
        ],
        theta_covariance,
    };

    let term_names = design.term_names();
    let column_terms: Vec<Option<String>> = design
        .assign()
        .iter()
        .map(|a| a.map(|t| term_names[t].clone()))
        .collect();
    let coefficients = test_coefficients(
        design.coefficient_names(),
        &column_terms,
        &selection.kept,
        &state.beta,
        &inputs,
    );

    let chol_lower = state
        .information
        .clone()
        .cholesky()
        .ok_or_else(|| LmmError::Numerical("X'V^-1 X is not positive definite".to_string()))?
        .l();
    let effect_terms: Vec<Option<usize>> = selection
        .kept
        .iter()
        .map(|&j| design.assign()[j])
        .collect();
    let anova = sequential_anova(
        term_names,
        &effect_terms,
        &chol_lower,
        &state.beta,
        variance.residual,
        &inputs,
    );

    let blups = (z.transpose() * &state.py) * variance.between;
    let fitted_marginal = &x * &state.beta;
    let fitted_conditional = &fitted_marginal + z * &blups;
    let residuals = &y - &fitted_conditional;

    let sizes = random.observations_per_group();
    let random_effects = random
        .group_ids
        .iter()
        .enumerate()
        .map(|(g, id)| GroupEffect {
            group: id.clone(),
            n_observations: sizes[g],
            blup: blups[g],
        })
        .collect();

    info!(
        between = variance.between,
        residual = variance.residual,
        iterations = reml.iterations,
        log_reml = state.log_likelihood,
        "mixed model fitted"
    );

    Ok(FittedModel {
        formula: format!(
            "{} {} + (1 | {})",
            dataset.response_name(),
            spec,
            grouping
        ),
        response: dataset.response_name().to_string(),
        grouping: grouping.clone(),
        coding: config.coding,
        coefficients,
        variance,
        icc: variance.icc(),
        anova,
        random_effects,
        fitted_marginal: fitted_marginal.iter().copied().collect(),
        fitted_conditional: fitted_conditional.iter().copied().collect(),
        residuals: residuals.iter().copied().collect(),
        log_reml: state.log_likelihood,
        iterations: reml.iterations,
        n_observations: n,
        n_groups: random.n_groups,
        rank,
        df_residual: n - rank,
        warnings,
        covariance: state.covariance.clone(),
        kept: selection.kept.clone(),
    })
}

/// Asymptotic covariance of the REML estimates over the free components.
fn theta_covariance(info: &Matrix2<f64>, config: &LmmConfig) -> Result<Matrix2<f64>> {
    if config.fixed_between_variance.is_some() {
        let ee = info[(1, 1)];
        let var = if ee > 0.0 { 1.0 / ee } else { 0.0 };
        return Ok(Matrix2::new(0.0, 0.0, 0.0, var));
    }
    match info.try_inverse() {
        Some(inv) => Ok(inv),
        None => info
            .pseudo_inverse(1e-12)
            .map_err(|e| LmmError::Numerical(format!("Cannot invert REML information: {}", e))),
    }
}

/// Parse a mixed formula and fit it.
///
/// The left-hand side, if present, must name the dataset's response.
pub fn fit_formula(dataset: &Dataset, formula: &str, config: &LmmConfig) -> Result<FittedModel> {
    let parsed = MixedFormula::parse(formula)?;
    if let Some(response) = &parsed.response {
        if response != dataset.response_name() {
            return Err(LmmError::MalformedDesign(format!(
                "Formula response '{}' does not match dataset response '{}'",
                response,
                dataset.response_name()
            )));
        }
    }
    fit(dataset, &parsed.fixed, &parsed.random.grouping, config)
}

/// Fit several alternative specifications against the same data in parallel.
///
/// Results are returned in the order of `specs`; each fit is independent.
pub fn fit_many(
    dataset: &Dataset,
    specs: &[DesignSpecification],
    grouping: &GroupingKey,
    config: &LmmConfig,
) -> Vec<Result<FittedModel>> {
    specs
        .par_iter()
        .map(|spec| fit(dataset, spec, grouping, config))
        .collect()
}
