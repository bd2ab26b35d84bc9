//! Stationary covariance kernels with per-dimension lengthscales.
//!
//! Hyperparameters are passed as a flat slice `[l_1, .., l_d, sigma2]`
//! (one lengthscale per input dimension followed by the signal
//! variance), so the caches can key results off the raw values without
//! knowing the kernel family.

use nalgebra::{DMatrix, DVector};

use crate::linalg;

const SQRT_5: f64 = 2.236_067_977_499_79;

/// Covariance kernel family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kernel {
    /// `sigma2 * exp(-0.5 * sum((d_i / l_i)^2))`.
    SquaredExponential,
    /// Matern with smoothness 5/2, twice differentiable at the origin.
    Matern52,
}

impl Kernel {
    /// Number of hyperparameters for a `dimension`-dimensional input.
    #[must_use]
    pub fn n_params(self, dimension: usize) -> usize {
        dimension + 1
    }

    /// Component names used in debug filenames.
    #[must_use]
    pub fn components(self) -> Vec<String> {
        let name = match self {
            Kernel::SquaredExponential => "squared_exponential",
            Kernel::Matern52 => "matern52",
        };
        vec![name.to_string()]
    }

    /// Covariance between two points.
    #[must_use]
    pub fn cov(self, x1: &[f64], x2: &[f64], params: &[f64]) -> f64 {
        let (lengthscales, signal_var) = split_params(params, x1.len());
        let r_sq = scaled_r_sq(x1, x2, lengthscales);
        match self {
            Kernel::SquaredExponential => signal_var * (-0.5 * r_sq).exp(),
            Kernel::Matern52 => {
                let r = r_sq.sqrt();
                signal_var * (1.0 + SQRT_5 * r + 5.0 / 3.0 * r_sq) * (-SQRT_5 * r).exp()
            }
        }
    }

    /// Gradient of `cov(x1, x2)` with respect to `x1`.
    ///
    /// Both families share the form `factor * d_i / l_i^2`, which is
    /// smooth at `x1 == x2` (the gradient vanishes there).
    #[must_use]
    pub fn grad_wrt_x1(self, x1: &[f64], x2: &[f64], params: &[f64]) -> DVector<f64> {
        let (lengthscales, signal_var) = split_params(params, x1.len());
        let factor = match self {
            Kernel::SquaredExponential => -self.cov(x1, x2, params),
            Kernel::Matern52 => {
                let r = scaled_r_sq(x1, x2, lengthscales).sqrt();
                -(5.0 / 3.0) * signal_var * (1.0 + SQRT_5 * r) * (-SQRT_5 * r).exp()
            }
        };
        DVector::from_fn(x1.len(), |i, _| {
            factor * (x1[i] - x2[i]) / (lengthscales[i] * lengthscales[i])
        })
    }

    /// Covariance matrix of a point set against itself, without noise.
    #[must_use]
    pub fn cov_matrix(self, points: &DMatrix<f64>, params: &[f64]) -> DMatrix<f64> {
        let rows = linalg::matrix_rows(points);
        DMatrix::from_fn(rows.len(), rows.len(), |i, j| self.cov(&rows[i], &rows[j], params))
    }

    /// Cross-covariance matrix between two point sets.
    #[must_use]
    pub fn cross_cov_matrix(
        self,
        points_1: &DMatrix<f64>,
        points_2: &DMatrix<f64>,
        params: &[f64],
    ) -> DMatrix<f64> {
        let rows_1 = linalg::matrix_rows(points_1);
        let rows_2 = linalg::matrix_rows(points_2);
        DMatrix::from_fn(rows_1.len(), rows_2.len(), |i, j| {
            self.cov(&rows_1[i], &rows_2[j], params)
        })
    }

    /// Gradients of `cov(point, p_j)` with respect to `point`, one row
    /// per row of `points_2`.
    #[must_use]
    pub fn grad_matrix_wrt_point(
        self,
        point: &[f64],
        points_2: &DMatrix<f64>,
        params: &[f64],
    ) -> DMatrix<f64> {
        let rows = linalg::matrix_rows(points_2);
        let mut out = DMatrix::zeros(rows.len(), point.len());
        for (j, other) in rows.iter().enumerate() {
            let grad = self.grad_wrt_x1(point, other, params);
            for i in 0..point.len() {
                out[(j, i)] = grad[i];
            }
        }
        out
    }
}

fn split_params(params: &[f64], dimension: usize) -> (&[f64], f64) {
    debug_assert_eq!(params.len(), dimension + 1);
    (&params[..dimension], params[dimension])
}

fn scaled_r_sq(x1: &[f64], x2: &[f64], lengthscales: &[f64]) -> f64 {
    let mut r_sq = 0.0;
    for i in 0..x1.len() {
        let diff = (x1[i] - x2[i]) / lengthscales[i];
        r_sq += diff * diff;
    }
    r_sq
}
