//! REML estimation of the two variance components.
//!
//! The marginal covariance is `V = σ²_g ZZ' + σ²_e I`. Estimation is by
//! Fisher scoring on the restricted log-likelihood, started from
//! Henderson's method-of-moments (Method III) estimates.

use crate::error::{LmmError, Result};
use crate::model::rank::independent_columns;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, trace};

/// Maximum number of step halvings per scoring iteration.
const MAX_HALVINGS: usize = 30;

/// Between-group and residual variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    /// Random-intercept variance σ²_g.
    pub between: f64,
    /// Residual variance σ²_e.
    pub residual: f64,
}

impl VarianceComponents {
    pub fn new(between: f64, residual: f64) -> Self {
        Self { between, residual }
    }

    /// Total variance σ²_g + σ²_e.
    pub fn total(&self) -> f64 {
        self.between + self.residual
    }

    /// Intraclass correlation σ²_g / (σ²_g + σ²_e).
    pub fn icc(&self) -> f64 {
        let total = self.total();
        if total > 0.0 {
            self.between / total
        } else {
            f64::NAN
        }
    }

    /// Ratio σ²_g / σ²_e.
    pub fn ratio(&self) -> f64 {
        self.between / self.residual
    }

    fn as_vector(&self) -> Vector2<f64> {
        Vector2::new(self.between, self.residual)
    }
}

/// Settings for the scoring iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemlControl {
    pub max_iter: usize,
    pub tol: f64,
    pub var_lower_bound: f64,
    /// Pinned between-group variance, estimated only σ²_e if set.
    pub fixed_between: Option<f64>,
}

/// Quantities of the restricted likelihood at one parameter value.
pub(crate) struct RemlState {
    pub theta: VarianceComponents,
    pub v_inv: DMatrix<f64>,
    pub v_inv_x: DMatrix<f64>,
    /// X'V⁻¹X.
    pub information: DMatrix<f64>,
    /// (X'V⁻¹X)⁻¹.
    pub covariance: DMatrix<f64>,
    pub beta: DVector<f64>,
    /// P = V⁻¹ - V⁻¹X(X'V⁻¹X)⁻¹X'V⁻¹.
    pub projection: DMatrix<f64>,
    pub py: DVector<f64>,
    pub log_likelihood: f64,
}

impl RemlState {
    /// Evaluate the restricted likelihood at `theta`.
    ///
    /// `x` must have full column rank.
    pub fn evaluate(
        y: &DVector<f64>,
        x: &DMatrix<f64>,
        zzt: &DMatrix<f64>,
        theta: VarianceComponents,
    ) -> Result<Self> {
        let n = y.len();
        let p = x.ncols();

        let mut v = zzt * theta.between;
        for i in 0..n {
            v[(i, i)] += theta.residual;
        }

        let v_chol = v.cholesky().ok_or_else(|| {
            LmmError::Numerical(format!(
                "V is not positive definite at between = {:e}, residual = {:e}",
                theta.between, theta.residual
            ))
        })?;
        let log_det_v = 2.0 * v_chol.l().diagonal().map(|d| d.ln()).sum();
        let v_inv = v_chol.inverse();
        let v_inv_x = v_chol.solve(x);

        let information = x.transpose() * &v_inv_x;
        let info_chol = information.clone().cholesky().ok_or_else(|| {
            LmmError::Numerical("X'V^-1 X is not positive definite".to_string())
        })?;
        let log_det_info = 2.0 * info_chol.l().diagonal().map(|d| d.ln()).sum();
        let covariance = info_chol.inverse();

        let beta = &covariance * (v_inv_x.transpose() * y);
        let projection = &v_inv - &v_inv_x * &covariance * v_inv_x.transpose();
        let py = &projection * y;
        let quad = y.dot(&py);

        let log_likelihood =
            -0.5 * (log_det_v + log_det_info + quad + (n - p) as f64 * (2.0 * PI).ln());

        Ok(Self {
            theta,
            v_inv,
            v_inv_x,
            information,
            covariance,
            beta,
            projection,
            py,
            log_likelihood,
        })
    }

    /// Score vector and expected information for (σ²_g, σ²_e).
    pub fn score_and_information(&self, z: &DMatrix<f64>) -> (Vector2<f64>, Matrix2<f64>) {
        let pz = &self.projection * z;
        let ztpz = z.transpose() * &pz;
        let ztpy = z.transpose() * &self.py;

        let score_g = -0.5 * (ztpz.trace() - ztpy.norm_squared());
        let score_e = -0.5 * (self.projection.trace() - self.py.norm_squared());

        let info_gg = 0.5 * ztpz.norm_squared();
        let info_ge = 0.5 * pz.norm_squared();
        let info_ee = 0.5 * self.projection.norm_squared();

        (
            Vector2::new(score_g, score_e),
            Matrix2::new(info_gg, info_ge, info_ge, info_ee),
        )
    }
}

/// Outcome of a converged REML fit.
pub(crate) struct RemlFit {
    pub state: RemlState,
    pub iterations: usize,
    pub score: Vector2<f64>,
    pub expected_information: Matrix2<f64>,
}

/// Henderson Method III estimates of the variance components.
///
/// σ²_e comes from the residual of y on [X | Z]; σ²_g from the extra
/// reduction due to Z after X, truncated at zero. With a pinned σ²_g the
/// residual variance is seeded from the OLS residual on X alone.
pub(crate) fn moment_seed(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    z: &DMatrix<f64>,
    control: &RemlControl,
    rank_tol: f64,
) -> Result<VarianceComponents> {
    let n = y.len();
    let x_sel = independent_columns(x, rank_tol);
    let r_x = x_sel.rank();
    let rss_x = x_sel.residual(y).norm_squared();

    if let Some(between) = control.fixed_between {
        let residual = (rss_x / (n - r_x) as f64).max(control.var_lower_bound);
        return Ok(VarianceComponents::new(between, residual));
    }

    let mut xz = DMatrix::zeros(n, x.ncols() + z.ncols());
    xz.columns_mut(0, x.ncols()).copy_from(x);
    xz.columns_mut(x.ncols(), z.ncols()).copy_from(z);
    let xz_sel = independent_columns(&xz, rank_tol);
    let r_xz = xz_sel.rank();

    if n <= r_xz {
        return Err(LmmError::InsufficientData(format!(
            "No residual degrees of freedom within groups ({} observations, rank of [X | Z] = {})",
            n, r_xz
        )));
    }

    let rss_xz = xz_sel.residual(y).norm_squared();
    let residual = (rss_xz / (n - r_xz) as f64).max(control.var_lower_bound);

    let trace = x_sel.residual_matrix(z).norm_squared();
    let between = if trace > f64::EPSILON {
        ((rss_x - rss_xz - (r_xz - r_x) as f64 * residual) / trace).max(0.0)
    } else {
        0.0
    };

    debug!(
        between,
        residual,
        rank_x = r_x,
        rank_xz = r_xz,
        "method-of-moments seed"
    );
    Ok(VarianceComponents::new(between, residual))
}

/// Largest relative change between two parameter values.
fn relative_change(old: &VarianceComponents, new: &VarianceComponents, floor: f64) -> f64 {
    let rel = |a: f64, b: f64| (b - a).abs() / a.abs().max(floor);
    rel(old.between, new.between).max(rel(old.residual, new.residual))
}

/// One Fisher-scoring proposal from `state`, respecting the bounds.
fn propose(
    state: &RemlState,
    score: &Vector2<f64>,
    info: &Matrix2<f64>,
    control: &RemlControl,
) -> VarianceComponents {
    let theta = state.theta;
    let residual_only = |theta: VarianceComponents| {
        let step = if info[(1, 1)] > 0.0 {
            score[1] / info[(1, 1)]
        } else {
            0.0
        };
        VarianceComponents::new(
            theta.between,
            (theta.residual + step).max(control.var_lower_bound),
        )
    };

    if control.fixed_between.is_some() {
        return residual_only(theta);
    }

    let step = match info.try_inverse() {
        Some(inv) => inv * score,
        None => return residual_only(theta),
    };
    let next = theta.as_vector() + step;

    if next[0] < 0.0 {
        // Boundary: pin σ²_g at zero and move σ²_e alone
        return residual_only(VarianceComponents::new(0.0, theta.residual));
    }
    VarianceComponents::new(next[0], next[1].max(control.var_lower_bound))
}

/// Maximize the restricted likelihood by Fisher scoring.
///
/// Each iteration proposes a scoring step; the fit has converged when
/// the proposal changes neither component by more than `tol` relative to
/// its current value. Steps that lower the likelihood are halved.
pub(crate) fn estimate(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    z: &DMatrix<f64>,
    seed: VarianceComponents,
    control: &RemlControl,
) -> Result<RemlFit> {
    let zzt = z * z.transpose();
    let mut state = RemlState::evaluate(y, x, &zzt, seed)?;
    let mut iterations = 0;

    loop {
        let (score, info) = state.score_and_information(z);
        let proposal = propose(&state, &score, &info, control);
        let change = relative_change(&state.theta, &proposal, control.var_lower_bound);

        trace!(
            iteration = iterations,
            between = state.theta.between,
            residual = state.theta.residual,
            log_reml = state.log_likelihood,
            change,
            "REML scoring step"
        );

        if change < control.tol {
            debug!(
                iterations,
                between = state.theta.between,
                residual = state.theta.residual,
                log_reml = state.log_likelihood,
                "REML converged"
            );
            return Ok(RemlFit {
                state,
                iterations,
                score,
                expected_information: info,
            });
        }

        if iterations >= control.max_iter {
            return Err(LmmError::Convergence {
                iterations,
                between: state.theta.between,
                residual: state.theta.residual,
            });
        }

        state = line_search(y, x, &zzt, state, proposal)?;
        iterations += 1;
    }
}

/// Step from `state` towards `proposal`, halving until the likelihood does not drop.
fn line_search(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    zzt: &DMatrix<f64>,
    state: RemlState,
    proposal: VarianceComponents,
) -> Result<RemlState> {
    let start = state.theta;
    let mut fraction = 1.0;

    for _ in 0..MAX_HALVINGS {
        let candidate = VarianceComponents::new(
            start.between + fraction * (proposal.between - start.between),
            start.residual + fraction * (proposal.residual - start.residual),
        );
        if let Ok(next) = RemlState::evaluate(y, x, zzt, candidate) {
            let slack = 1e-10 * state.log_likelihood.abs().max(1.0);
            if next.log_likelihood >= state.log_likelihood - slack {
                return Ok(next);
            }
        }
        fraction *= 0.5;
    }

    debug!(
        between = start.between,
        residual = start.residual,
        "step halving exhausted, keeping full step"
    );
    RemlState::evaluate(y, x, zzt, proposal)
}
