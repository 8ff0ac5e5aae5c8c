//! Order-preserving column rank reduction.
//!
//! Columns are visited left to right; a column whose component outside
//! the span of the columns already kept is negligible relative to its own
//! norm is dropped. Identical or otherwise collinear columns therefore
//! always lose to the column that appears first.

use nalgebra::{DMatrix, DVector};

/// Result of reducing a matrix to linearly independent columns.
#[derive(Debug, Clone)]
pub struct ColumnSelection {
    /// Indices of the retained columns, in original order.
    pub kept: Vec<usize>,
    /// Indices of the dropped columns, in original order.
    pub dropped: Vec<usize>,
    /// Orthonormal basis (n × kept.len()) of the retained column span.
    pub basis: DMatrix<f64>,
}

impl ColumnSelection {
    /// Rank of the reduced matrix.
    pub fn rank(&self) -> usize {
        self.kept.len()
    }

    /// Residual of `v` after projecting out the retained span.
    pub fn residual(&self, v: &DVector<f64>) -> DVector<f64> {
        v - &self.basis * (self.basis.transpose() * v)
    }

    /// Columnwise residuals of `m` after projecting out the retained span.
    pub fn residual_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        m - &self.basis * (self.basis.transpose() * m)
    }
}

/// Select a maximal set of linearly independent columns of `x`.
///
/// Uses modified Gram-Schmidt with one reorthogonalization pass. A column
/// is dropped when its residual norm is at most `tol` times its original
/// norm (all-zero columns are always dropped).
pub fn independent_columns(x: &DMatrix<f64>, tol: f64) -> ColumnSelection {
    let n = x.nrows();
    let mut basis: Vec<DVector<f64>> = Vec::with_capacity(x.ncols());
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for j in 0..x.ncols() {
        let original = x.column(j).clone_owned();
        let norm = original.norm();
        let mut v = original;

        for _ in 0..2 {
            for q in &basis {
                let proj = q.dot(&v);
                v.axpy(-proj, q, 1.0);
            }
        }

        let resid = v.norm();
        if norm == 0.0 || resid <= tol * norm {
            dropped.push(j);
        } else {
            basis.push(v / resid);
            kept.push(j);
        }
    }

    let basis = if basis.is_empty() {
        DMatrix::zeros(n, 0)
    } else {
        DMatrix::from_columns(&basis)
    };

    ColumnSelection {
        kept,
        dropped,
        basis,
    }
}
