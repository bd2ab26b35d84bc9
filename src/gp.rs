//! Gaussian-process surrogate over the full `(x, w)` domain.
//!
//! The quadrature engine only needs covariance evaluations and a cached
//! Cholesky factor of the prior over the training points, so those
//! operations live behind the [`CovarianceProvider`] trait. The
//! concrete [`GpModel`] pairs a stationary [`Kernel`] with training
//! data and holds the single-slot factor cache; anything else that can
//! answer covariance queries (a sparse approximation, a composed
//! kernel) can drive the engine by implementing the trait.
//!
//! Kernel hyperparameters are passed explicitly to every evaluation
//! rather than read from the model, so hyperparameter search can probe
//! values without rebuilding the model; the factor cache keys off the
//! values it was computed under and refreshes itself when they change.

use std::sync::Arc;

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::linalg;

/// Default observation noise added to the prior diagonal.
pub const DEFAULT_VAR_NOISE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Cholesky factor of the noisy prior plus the solved data vector.
///
/// `solve` is `K^-1 (y - mean)`; every posterior quantity of the engine
/// is a product against it or a triangular solve against `chol`.
#[derive(Clone, Debug)]
pub struct PosteriorFactor {
    /// Factorization of `K + var_noise * I` over the training points.
    pub chol: Cholesky<f64, Dyn>,
    /// `K^-1 (y - mean)` for the training evaluations `y`.
    pub solve: DVector<f64>,
}

/// Covariance queries the quadrature engine needs from a surrogate.
pub trait CovarianceProvider: Send + Sync {
    /// Number of coordinates of the full `(x, w)` domain.
    fn dimension(&self) -> usize;

    /// Box bounds of the full domain, one `(low, high)` pair per
    /// coordinate.
    fn bounds(&self) -> &[(f64, f64)];

    /// Current kernel hyperparameters, `[l_1, .., l_d, sigma2]`.
    fn kernel_params(&self) -> &[f64];

    /// Observation noise variance.
    fn var_noise(&self) -> f64;

    /// Prior mean.
    fn mean(&self) -> f64;

    /// Training inputs, one point per row.
    fn historical_points(&self) -> &DMatrix<f64>;

    /// Training observations, aligned with [`Self::historical_points`].
    fn historical_evaluations(&self) -> &DVector<f64>;

    /// Kernel component names used in debug filenames.
    fn kernel_components(&self) -> Vec<String>;

    /// Covariance matrix of a point set against itself, without noise.
    fn evaluate_cov(&self, points: &DMatrix<f64>, kernel_params: &[f64]) -> DMatrix<f64>;

    /// Cross-covariance matrix between two point sets.
    fn evaluate_cross_cov(
        &self,
        points_1: &DMatrix<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64>;

    /// Gradients of `cov(point, p_j)` with respect to `point`, one row
    /// per row of `points_2`.
    fn evaluate_grad_cross_cov_respect_point(
        &self,
        point: &DVector<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64>;

    /// Cholesky factor of the noisy prior and the solved data vector.
    ///
    /// With `cache` set, a factor computed under the same
    /// `(var_noise, mean, kernel_params)` is reused; computing under
    /// different values replaces it. With `cache` unset the factor is
    /// computed fresh and the slot is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonPositiveDefinite`] when the noisy prior has
    /// no Cholesky factorization, and [`Error::DimensionMismatch`] when
    /// `kernel_params` has the wrong length.
    fn posterior_factor(
        &self,
        var_noise: f64,
        mean: f64,
        kernel_params: &[f64],
        cache: bool,
    ) -> Result<Arc<PosteriorFactor>>;

    /// Drop any cached factorization.
    fn clear_cache(&self);
}

// ---------------------------------------------------------------------------
// Concrete model
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FactorSlot {
    key: Vec<u64>,
    factor: Arc<PosteriorFactor>,
}

/// Gaussian process with a stationary kernel over the full domain.
#[derive(Debug)]
pub struct GpModel {
    kernel: Kernel,
    kernel_params: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    points: DMatrix<f64>,
    evaluations: DVector<f64>,
    var_noise: f64,
    mean: f64,
    factor: Mutex<Option<FactorSlot>>,
}

impl GpModel {
    /// Start building a model.
    #[must_use]
    pub fn builder() -> GpModelBuilder {
        GpModelBuilder::new()
    }
}

impl CovarianceProvider for GpModel {
    fn dimension(&self) -> usize {
        self.bounds.len()
    }

    fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn kernel_params(&self) -> &[f64] {
        &self.kernel_params
    }

    fn var_noise(&self) -> f64 {
        self.var_noise
    }

    fn mean(&self) -> f64 {
        self.mean
    }

    fn historical_points(&self) -> &DMatrix<f64> {
        &self.points
    }

    fn historical_evaluations(&self) -> &DVector<f64> {
        &self.evaluations
    }

    fn kernel_components(&self) -> Vec<String> {
        self.kernel.components()
    }

    fn evaluate_cov(&self, points: &DMatrix<f64>, kernel_params: &[f64]) -> DMatrix<f64> {
        self.kernel.cov_matrix(points, kernel_params)
    }

    fn evaluate_cross_cov(
        &self,
        points_1: &DMatrix<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64> {
        self.kernel.cross_cov_matrix(points_1, points_2, kernel_params)
    }

    fn evaluate_grad_cross_cov_respect_point(
        &self,
        point: &DVector<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64> {
        self.kernel.grad_matrix_wrt_point(point.as_slice(), points_2, kernel_params)
    }

    fn posterior_factor(
        &self,
        var_noise: f64,
        mean: f64,
        kernel_params: &[f64],
        cache: bool,
    ) -> Result<Arc<PosteriorFactor>> {
        let expected = self.kernel.n_params(self.dimension());
        if kernel_params.len() != expected {
            return Err(Error::DimensionMismatch { expected, got: kernel_params.len() });
        }

        let key = factor_key(var_noise, mean, kernel_params);
        if cache
            && let Some(slot) = self.factor.lock().as_ref()
            && slot.key == key
        {
            return Ok(Arc::clone(&slot.factor));
        }

        let factor = Arc::new(self.compute_factor(var_noise, mean, kernel_params)?);
        if cache {
            *self.factor.lock() = Some(FactorSlot { key, factor: Arc::clone(&factor) });
        }
        Ok(factor)
    }

    fn clear_cache(&self) {
        *self.factor.lock() = None;
    }
}

impl GpModel {
    fn compute_factor(
        &self,
        var_noise: f64,
        mean: f64,
        kernel_params: &[f64],
    ) -> Result<PosteriorFactor> {
        let mut prior = self.kernel.cov_matrix(&self.points, kernel_params);
        for i in 0..prior.nrows() {
            prior[(i, i)] += var_noise;
        }
        let chol = linalg::cholesky(prior)?;
        let centered = self.evaluations.add_scalar(-mean);
        let solve = chol.solve(&centered);
        Ok(PosteriorFactor { chol, solve })
    }
}

fn factor_key(var_noise: f64, mean: f64, kernel_params: &[f64]) -> Vec<u64> {
    let mut key = vec![var_noise.to_bits(), mean.to_bits()];
    key.extend(kernel_params.iter().map(|p| p.to_bits()));
    key
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`GpModel`].
#[derive(Default)]
pub struct GpModelBuilder {
    kernel: Option<Kernel>,
    kernel_params: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    points: Option<DMatrix<f64>>,
    evaluations: Option<DVector<f64>>,
    var_noise: f64,
    mean: f64,
}

impl GpModelBuilder {
    /// Create a builder with the default noise and a zero prior mean.
    #[must_use]
    pub fn new() -> Self {
        Self { var_noise: DEFAULT_VAR_NOISE, ..Self::default() }
    }

    /// Kernel family (defaults to [`Kernel::Matern52`]).
    #[must_use]
    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Kernel hyperparameters, `[l_1, .., l_d, sigma2]`.
    #[must_use]
    pub fn kernel_params(mut self, params: Vec<f64>) -> Self {
        self.kernel_params = params;
        self
    }

    /// Box bounds of the full domain, one pair per coordinate.
    #[must_use]
    pub fn bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Training inputs (one point per row) and observations.
    #[must_use]
    pub fn training_data(mut self, points: DMatrix<f64>, evaluations: DVector<f64>) -> Self {
        self.points = Some(points);
        self.evaluations = Some(evaluations);
        self
    }

    /// Observation noise variance (defaults to [`DEFAULT_VAR_NOISE`]).
    #[must_use]
    pub fn var_noise(mut self, var_noise: f64) -> Self {
        self.var_noise = var_noise;
        self
    }

    /// Prior mean (defaults to zero).
    #[must_use]
    pub fn mean(mut self, mean: f64) -> Self {
        self.mean = mean;
        self
    }

    /// Validate the configuration and build the model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] when a bound pair is not
    /// strictly ordered, and [`Error::DimensionMismatch`] when the
    /// bounds, training points, evaluations, and hyperparameters do not
    /// agree on their sizes.
    pub fn build(self) -> Result<GpModel> {
        let kernel = self.kernel.unwrap_or(Kernel::Matern52);
        let points = self.points.unwrap_or_else(|| DMatrix::zeros(0, self.bounds.len()));
        let evaluations = self.evaluations.unwrap_or_else(|| DVector::zeros(0));

        for &(low, high) in &self.bounds {
            if low >= high || !low.is_finite() || !high.is_finite() {
                return Err(Error::InvalidBounds { low, high });
            }
        }
        let dimension = self.bounds.len();
        if points.ncols() != dimension {
            return Err(Error::DimensionMismatch { expected: dimension, got: points.ncols() });
        }
        if evaluations.len() != points.nrows() {
            return Err(Error::DimensionMismatch {
                expected: points.nrows(),
                got: evaluations.len(),
            });
        }
        let expected_params = kernel.n_params(dimension);
        if self.kernel_params.len() != expected_params {
            return Err(Error::DimensionMismatch {
                expected: expected_params,
                got: self.kernel_params.len(),
            });
        }

        Ok(GpModel {
            kernel,
            kernel_params: self.kernel_params,
            bounds: self.bounds,
            points,
            evaluations,
            var_noise: self.var_noise,
            mean: self.mean,
            factor: Mutex::new(None),
        })
    }
}
