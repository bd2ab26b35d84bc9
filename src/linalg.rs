//! Dense linear-algebra helpers shared by the posterior computations.
//!
//! Every solve against the prior covariance goes through a cached
//! [`Cholesky`] factorization; this module owns the fallible
//! factorization step and a few small matrix utilities that nalgebra
//! does not provide directly.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, Dyn};

use crate::error::{Error, Result};

/// Factor a symmetric positive-definite matrix, consuming it.
///
/// # Errors
///
/// Returns [`Error::NonPositiveDefinite`] when the factorization fails,
/// which for covariance matrices means the kernel hyperparameters or the
/// noise variance make the prior numerically singular.
pub(crate) fn cholesky(matrix: DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    let size = matrix.nrows();
    Cholesky::new(matrix).ok_or(Error::NonPositiveDefinite { size })
}

/// Copy each row of `matrix` into its own `Vec`.
///
/// nalgebra stores matrices column-major, so kernels that work on point
/// slices need an explicit row extraction.
pub(crate) fn matrix_rows(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..matrix.nrows())
        .map(|i| matrix.row(i).iter().copied().collect())
        .collect()
}

/// Build a new matrix from the given rows of `matrix`, in order.
///
/// Indices may repeat; callers validate that they are in range.
pub(crate) fn select_rows(matrix: &DMatrix<f64>, indexes: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(indexes.len(), matrix.ncols(), |i, j| matrix[(indexes[i], j)])
}
