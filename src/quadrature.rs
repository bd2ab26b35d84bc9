//! Bayesian-quadrature engine over a Gaussian-process surrogate.
//!
//! The engine models `g(x) = E_w[f(x, w)]` through a GP on the full
//! `(x, w)` domain and exposes the posterior of `g` directly: every
//! quantity is an expectation of GP covariances under the task
//! distribution, so no samples of `g` itself are ever needed.
//!
//! For a candidate observation point `z` it also produces the two
//! knowledge-gradient ingredients on a discretization `x_1..x_n` of
//! the decision domain: the current posterior means `a_i` and the
//! updating weights
//! `b_i = (B(x_i, z) - vec_covs_i K^-1 k(z)) / sqrt(k(z, z) - k(z)^T K^-1 k(z))`,
//! where `B(x, z) = E_w[cov(f(x, w), f(z))]`. See Toscano-Palmerin and
//! Frazier, "Bayesian optimization with expensive integrands",
//! `arXiv:1803.08661`.
//!
//! Expensive intermediates are cached in single slots keyed by the
//! kernel hyperparameters; probing new hyperparameters evicts them
//! automatically. Batched row computations can run on the rayon pool
//! and handle failed rows according to the engine's [`FillPolicy`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{self, QuadratureCache, SlotKind};
use crate::distribution::{DomainPartition, TaskDistribution};
use crate::error::{Error, Result};
use crate::gp::{CovarianceProvider, PosteriorFactor};
use crate::optimize::{self, OptimizeResult};
use crate::parallel::{self, FillPolicy};
use crate::report::{self, GridEvaluations, RunKey};
use crate::rng_util;
use crate::types::Direction;

/// Default iteration cap of the posterior-mean optimizer.
pub const DEFAULT_MAX_OPTIMIZER_ITERS: u64 = 500;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Options for [`BayesianQuadrature::compute_posterior_parameters`].
#[derive(Clone, Copy, Debug)]
pub struct PosteriorOptions {
    /// Skip the posterior covariance and return the mean alone.
    pub only_mean: bool,
    /// Reuse the cached Cholesky factor of the surrogate.
    pub cache: bool,
    /// Evaluate the rows on the rayon pool.
    pub parallel: bool,
}

impl Default for PosteriorOptions {
    fn default() -> Self {
        Self { only_mean: false, cache: true, parallel: false }
    }
}

/// Options for the knowledge-gradient computations.
#[derive(Clone, Copy, Debug)]
pub struct KgOptions {
    /// Reuse and fill the single-slot caches.
    pub cache: bool,
    /// Evaluate the rows on the rayon pool.
    pub parallel: bool,
}

impl Default for KgOptions {
    fn default() -> Self {
        Self { cache: true, parallel: false }
    }
}

/// Options for [`BayesianQuadrature::gradient_vector_b`].
#[derive(Clone, Debug)]
pub struct GradientBOptions {
    /// Reuse and fill the single-slot caches.
    pub cache: bool,
    /// Evaluate fresh rows on the rayon pool.
    pub parallel: bool,
    /// Row indices selecting the passed points out of the larger
    /// discretization that cached matrices were computed over.
    pub keep_indexes: Option<Vec<usize>>,
}

impl Default for GradientBOptions {
    fn default() -> Self {
        Self { cache: true, parallel: false, keep_indexes: None }
    }
}

/// Posterior of the objective `g` at evaluation points.
#[derive(Clone, Debug)]
pub struct PosteriorParameters {
    /// Posterior mean, one entry per evaluation point.
    pub mean: DVector<f64>,
    /// Posterior variance; present only for single-point requests
    /// without `only_mean`.
    pub cov: Option<f64>,
    /// Rows zero-filled under [`FillPolicy::Zero`].
    pub failed_rows: Vec<usize>,
}

/// Knowledge-gradient ingredients for one candidate.
#[derive(Clone, Debug)]
pub struct KgParameters {
    /// Posterior mean over the discretization.
    pub a: DVector<f64>,
    /// Updating weights over the discretization.
    pub b: DVector<f64>,
    /// Rows zero-filled under [`FillPolicy::Zero`].
    pub failed_rows: Vec<usize>,
}

/// Knowledge-gradient ingredients for a candidate batch.
#[derive(Clone, Debug)]
pub struct KgParametersMany {
    /// Posterior mean over the discretization.
    pub a: DVector<f64>,
    /// Updating weights, one column per candidate.
    pub b: DMatrix<f64>,
    /// Rows zero-filled under [`FillPolicy::Zero`].
    pub failed_rows: Vec<usize>,
}

/// Raw quadrature vectors produced by
/// [`BayesianQuadrature::compute_vectors_b`].
#[derive(Clone, Debug)]
pub struct VectorsB {
    /// Quadrature cross-covariance against the historical points, one
    /// row per discretization point.
    pub vec_covs: Option<DMatrix<f64>>,
    /// Quadrature cross-covariance against the candidate points, one
    /// row per discretization point.
    pub b_new: Option<DMatrix<f64>>,
    /// Rows zero-filled under [`FillPolicy::Zero`].
    pub failed_rows: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Posterior engine for the objective `g(x) = E_w[f(x, w)]`.
pub struct BayesianQuadrature {
    gp: Arc<dyn CovarianceProvider>,
    partition: DomainPartition,
    distribution: TaskDistribution,
    cache: Mutex<QuadratureCache>,
    optimal_solutions: Mutex<Vec<OptimizeResult>>,
    fill_policy: FillPolicy,
    max_optimizer_iters: u64,
}

// manual impl: the surrogate is a trait object without a `Debug` bound
impl fmt::Debug for BayesianQuadrature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BayesianQuadrature")
            .field("partition", &self.partition)
            .field("distribution", &self.distribution)
            .field("fill_policy", &self.fill_policy)
            .field("max_optimizer_iters", &self.max_optimizer_iters)
            .finish_non_exhaustive()
    }
}

impl BayesianQuadrature {
    /// Build an engine over a surrogate, a domain partition, and a task
    /// distribution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] when the partition does not
    /// cover the surrogate's domain, and [`Error::InvalidDistribution`]
    /// when the distribution cannot drive the partition.
    pub fn new(
        gp: Arc<dyn CovarianceProvider>,
        partition: DomainPartition,
        distribution: TaskDistribution,
    ) -> Result<Self> {
        if partition.dimension() != gp.dimension() {
            return Err(Error::DimensionMismatch {
                expected: gp.dimension(),
                got: partition.dimension(),
            });
        }
        distribution.validate_partition(&partition)?;
        Ok(Self {
            gp,
            partition,
            distribution,
            cache: Mutex::new(QuadratureCache::default()),
            optimal_solutions: Mutex::new(Vec::new()),
            fill_policy: FillPolicy::default(),
            max_optimizer_iters: DEFAULT_MAX_OPTIMIZER_ITERS,
        })
    }

    /// Replace the policy applied to failed rows.
    #[must_use]
    pub fn with_fill_policy(mut self, fill_policy: FillPolicy) -> Self {
        self.fill_policy = fill_policy;
        self
    }

    /// Replace the iteration cap of the posterior-mean optimizer.
    #[must_use]
    pub fn with_max_optimizer_iters(mut self, max_iters: u64) -> Self {
        self.max_optimizer_iters = max_iters;
        self
    }

    /// The surrogate driving the engine.
    #[must_use]
    pub fn gp(&self) -> &Arc<dyn CovarianceProvider> {
        &self.gp
    }

    /// The decision/task split of the domain.
    #[must_use]
    pub fn partition(&self) -> &DomainPartition {
        &self.partition
    }

    /// The task distribution the expectations average over.
    #[must_use]
    pub fn distribution(&self) -> &TaskDistribution {
        &self.distribution
    }

    /// Snapshot of the posterior-mean optimization log, oldest first.
    #[must_use]
    pub fn optimal_solutions(&self) -> Vec<OptimizeResult> {
        self.optimal_solutions.lock().clone()
    }

    /// Drop every cached intermediate, including the surrogate's
    /// factorization. The optimization log is kept.
    pub fn clean_cache(&self) {
        self.cache.lock().clear();
        self.gp.clear_cache();
    }

    fn x_bounds(&self) -> Vec<(f64, f64)> {
        let bounds = self.gp.bounds();
        self.partition.x().iter().map(|&index| bounds[index]).collect()
    }

    fn ensure_x_points(&self, points: &DMatrix<f64>) -> Result<()> {
        ensure_size(self.partition.n_x(), points.ncols())
    }

    fn ensure_x_point(&self, point: &DVector<f64>) -> Result<()> {
        ensure_size(self.partition.n_x(), point.len())
    }

    fn ensure_domain_points(&self, points: &DMatrix<f64>) -> Result<()> {
        ensure_size(self.gp.dimension(), points.ncols())
    }

    fn ensure_domain_point(&self, point: &DVector<f64>) -> Result<()> {
        ensure_size(self.gp.dimension(), point.len())
    }

    // -----------------------------------------------------------------
    // Quadrature covariances
    // -----------------------------------------------------------------

    /// `E_{w,w'}[cov(f(x, w), f(x, w'))]`, the prior variance of
    /// `g(x)`.
    #[must_use]
    pub fn evaluate_quadrature_self_cov(&self, point: &DVector<f64>, kernel_params: &[f64]) -> f64 {
        debug_assert_eq!(point.len(), self.partition.n_x());
        self.distribution.double_expectation(
            |substituted| self.gp.evaluate_cov(substituted, kernel_params),
            point,
            &self.partition,
        )
    }

    /// `E_w[cov(f(x, w), f(p_j))]` for each row `p_j` of `points_2`
    /// (full domain coordinates).
    #[must_use]
    pub fn evaluate_quadrature_cross_cov(
        &self,
        point: &DVector<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DVector<f64> {
        debug_assert_eq!(point.len(), self.partition.n_x());
        self.distribution.expectation(
            |substituted| self.gp.evaluate_cross_cov(substituted, points_2, kernel_params),
            point,
            &self.partition,
        )
    }

    /// Gradient of [`Self::evaluate_quadrature_cross_cov`] with respect
    /// to the decision coordinates of `point`, as `n_x x m`.
    #[must_use]
    pub fn evaluate_grad_quadrature_cross_cov(
        &self,
        point: &DVector<f64>,
        points_2: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64> {
        debug_assert_eq!(point.len(), self.partition.n_x());
        self.distribution.gradient_expectation(
            |substituted| {
                self.gp.evaluate_grad_cross_cov_respect_point(substituted, points_2, kernel_params)
            },
            point,
            &self.partition,
        )
    }

    /// Gradient of `B(x_i, z)` with respect to the candidate `z`, one
    /// column per row of `points`, as `dimension x n`.
    #[must_use]
    pub fn evaluate_grad_quadrature_cross_cov_resp_candidate(
        &self,
        candidate_point: &DVector<f64>,
        points: &DMatrix<f64>,
        kernel_params: &[f64],
    ) -> DMatrix<f64> {
        debug_assert_eq!(candidate_point.len(), self.gp.dimension());
        self.distribution.gradient_expectation_resp_candidate(
            |substituted| {
                self.gp.evaluate_grad_cross_cov_respect_point(
                    candidate_point,
                    substituted,
                    kernel_params,
                )
            },
            points,
            &self.partition,
        )
    }

    // -----------------------------------------------------------------
    // Posterior parameters
    // -----------------------------------------------------------------

    /// Posterior mean (and, for a single point, variance) of `g` at the
    /// given decision points.
    ///
    /// The variance is skipped under `only_mean` and is only defined
    /// for a single evaluation point. Failed rows are handled by the
    /// engine's [`FillPolicy`] and reported in the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for wrongly shaped points,
    /// [`Error::MultiPointCovariance`] when the variance is requested
    /// for several points, [`Error::NonPositiveDefinite`] when the
    /// surrogate prior cannot be factored, and
    /// [`Error::PartialComputation`] when rows failed under a strict
    /// fill policy.
    pub fn compute_posterior_parameters(
        &self,
        points: &DMatrix<f64>,
        options: &PosteriorOptions,
    ) -> Result<PosteriorParameters> {
        self.ensure_x_points(points)?;
        let kernel_params = self.gp.kernel_params();
        let factor =
            self.gp.posterior_factor(self.gp.var_noise(), self.gp.mean(), kernel_params, options.cache)?;
        let historical = self.gp.historical_points();
        let n = points.nrows();

        let (rows, failed_rows) =
            parallel::run_with_policy(options.parallel, self.fill_policy, n, |i| {
                let x_point = points.row(i).transpose();
                finite_row(
                    self.evaluate_quadrature_cross_cov(&x_point, historical, kernel_params),
                    i,
                )
            })?;
        let mut vec_covs = DMatrix::zeros(n, historical.nrows());
        for (i, row) in rows.into_iter().enumerate() {
            if let Some(values) = row {
                fill_row(&mut vec_covs, i, &values);
            }
        }

        let mean = (&vec_covs * &factor.solve).add_scalar(self.gp.mean());
        if options.only_mean {
            return Ok(PosteriorParameters { mean, cov: None, failed_rows });
        }
        if n != 1 {
            return Err(Error::MultiPointCovariance { n_points: n });
        }

        let x_point = points.row(0).transpose();
        let self_cov = self.evaluate_quadrature_self_cov(&x_point, kernel_params);
        let solve = factor.chol.solve(&vec_covs.transpose());
        let cov = self_cov - (&vec_covs * &solve)[(0, 0)];
        Ok(PosteriorParameters { mean, cov: Some(cov), failed_rows })
    }

    /// Gradient of the posterior mean of `g` at one decision point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for a wrongly sized point
    /// and [`Error::NonPositiveDefinite`] when the surrogate prior
    /// cannot be factored.
    pub fn gradient_posterior_mean(&self, point: &DVector<f64>, cache: bool) -> Result<DVector<f64>> {
        self.ensure_x_point(point)?;
        let kernel_params = self.gp.kernel_params();
        let factor =
            self.gp.posterior_factor(self.gp.var_noise(), self.gp.mean(), kernel_params, cache)?;
        let grad = self.evaluate_grad_quadrature_cross_cov(
            point,
            self.gp.historical_points(),
            kernel_params,
        );
        Ok(&grad * &factor.solve)
    }

    // -----------------------------------------------------------------
    // Knowledge-gradient ingredients
    // -----------------------------------------------------------------

    /// Quadrature cross-covariance rows of the discretization against
    /// the historical points and/or candidate points, row by row.
    ///
    /// The flags select which matrices to build; rows are evaluated
    /// independently (optionally on the rayon pool) and failed rows are
    /// handled by the engine's [`FillPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for wrongly shaped inputs
    /// and [`Error::PartialComputation`] when rows failed under a
    /// strict fill policy.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_vectors_b(
        &self,
        points: &DMatrix<f64>,
        candidate_points: &DMatrix<f64>,
        historical_points: &DMatrix<f64>,
        kernel_params: &[f64],
        compute_vec_covs: bool,
        compute_b_new: bool,
        parallel: bool,
    ) -> Result<VectorsB> {
        self.ensure_x_points(points)?;
        self.ensure_domain_points(candidate_points)?;
        self.ensure_domain_points(historical_points)?;
        let (vec_covs, b_new, failed_rows) = self.vectors_b_core(
            points,
            candidate_points,
            historical_points,
            kernel_params,
            compute_vec_covs,
            compute_b_new,
            parallel,
        )?;
        Ok(VectorsB {
            vec_covs: compute_vec_covs.then_some(vec_covs),
            b_new: compute_b_new.then_some(b_new),
            failed_rows,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn vectors_b_core(
        &self,
        points: &DMatrix<f64>,
        candidate_points: &DMatrix<f64>,
        historical_points: &DMatrix<f64>,
        kernel_params: &[f64],
        compute_vec_covs: bool,
        compute_b_new: bool,
        parallel: bool,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>, Vec<usize>)> {
        let n = points.nrows();
        let (rows, failed_rows) =
            parallel::run_with_policy(parallel, self.fill_policy, n, |i| {
                let x_point = points.row(i).transpose();
                let vec_covs_row = if compute_vec_covs {
                    Some(finite_row(
                        self.evaluate_quadrature_cross_cov(
                            &x_point,
                            historical_points,
                            kernel_params,
                        ),
                        i,
                    )?)
                } else {
                    None
                };
                let b_new_row = if compute_b_new {
                    Some(finite_row(
                        self.evaluate_quadrature_cross_cov(
                            &x_point,
                            candidate_points,
                            kernel_params,
                        ),
                        i,
                    )?)
                } else {
                    None
                };
                Ok((vec_covs_row, b_new_row))
            })?;

        let mut vec_covs =
            DMatrix::zeros(if compute_vec_covs { n } else { 0 }, historical_points.nrows());
        let mut b_new =
            DMatrix::zeros(if compute_b_new { n } else { 0 }, candidate_points.nrows());
        for (i, row) in rows.into_iter().enumerate() {
            let Some((vec_covs_row, b_new_row)) = row else { continue };
            if let Some(values) = vec_covs_row {
                fill_row(&mut vec_covs, i, &values);
            }
            if let Some(values) = b_new_row {
                fill_row(&mut b_new, i, &values);
            }
        }
        Ok((vec_covs, b_new, failed_rows))
    }

    /// Knowledge-gradient ingredients `a` and `b` for one candidate.
    ///
    /// `a` is the posterior mean of `g` over the discretization; `b`
    /// scales the candidate's update by the posterior standard
    /// deviation of `f` at the candidate. A candidate that coincides
    /// with a historical point makes that deviation zero and the
    /// entries of `b` non-finite; callers choose candidates away from
    /// the history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for wrongly shaped inputs
    /// (including a cached discretization of a different size),
    /// [`Error::NonPositiveDefinite`] when the surrogate prior cannot
    /// be factored, and [`Error::PartialComputation`] when rows failed
    /// under a strict fill policy.
    pub fn compute_posterior_parameters_kg(
        &self,
        points: &DMatrix<f64>,
        candidate_point: &DVector<f64>,
        options: &KgOptions,
    ) -> Result<KgParameters> {
        self.ensure_x_points(points)?;
        self.ensure_domain_point(candidate_point)?;
        let kernel_params = self.gp.kernel_params();
        let factor =
            self.gp.posterior_factor(self.gp.var_noise(), self.gp.mean(), kernel_params, options.cache)?;
        let historical = self.gp.historical_points();
        let n = points.nrows();

        let quad_key = cache::hyper_key(kernel_params);
        let b_key = cache::hyper_point_key(kernel_params, candidate_point.as_slice());
        let (cached_vec_covs, cached_b_new) = if options.cache {
            let guard = self.cache.lock();
            (
                guard.get(SlotKind::Quadratures, &quad_key),
                guard.get(SlotKind::CandidateCrossCov, &b_key),
            )
        } else {
            (None, None)
        };
        if let Some(cached) = &cached_vec_covs {
            ensure_size(n, cached.nrows())?;
        }
        if let Some(cached) = &cached_b_new {
            ensure_size(n, cached.nrows())?;
        }

        let candidate_matrix = row_matrix(candidate_point);
        let need_vec_covs = cached_vec_covs.is_none();
        let need_b_new = cached_b_new.is_none();
        let (fresh_vec_covs, fresh_b_new, failed_rows) = if need_vec_covs || need_b_new {
            self.vectors_b_core(
                points,
                &candidate_matrix,
                historical,
                kernel_params,
                need_vec_covs,
                need_b_new,
                options.parallel,
            )?
        } else {
            (DMatrix::zeros(0, 0), DMatrix::zeros(0, 0), Vec::new())
        };
        if options.cache {
            let mut guard = self.cache.lock();
            if need_vec_covs {
                guard.put(SlotKind::Quadratures, quad_key.clone(), fresh_vec_covs.clone());
            }
            if need_b_new {
                guard.put(SlotKind::CandidateCrossCov, b_key, fresh_b_new.clone());
            }
        }
        let vec_covs = cached_vec_covs.unwrap_or(fresh_vec_covs);
        let b_new = cached_b_new.unwrap_or(fresh_b_new);

        let a = self.posterior_mean_vector(&vec_covs, &factor, &quad_key, n, options.cache);

        let cross_cov = self.gp.evaluate_cross_cov(&candidate_matrix, historical, kernel_params);
        let cross_cov_vec = cross_cov.transpose().column(0).clone_owned();
        let solve_2 = factor.chol.solve(&cross_cov_vec);
        let numerator = b_new.column(0).clone_owned() - &vec_covs * &solve_2;
        let self_cov =
            self.gp.evaluate_cross_cov(&candidate_matrix, &candidate_matrix, kernel_params)[(0, 0)];
        let denominator = (self_cov - cross_cov_vec.dot(&solve_2)).max(0.0).sqrt();
        let b = numerator / denominator;

        Ok(KgParameters { a, b, failed_rows })
    }

    /// Knowledge-gradient ingredients for a batch of candidates, one
    /// `b` column per candidate.
    ///
    /// The historical block is cached as usual, but the candidate block
    /// is recomputed every call: keying it on a whole batch would evict
    /// the slot on every new batch without ever hitting.
    ///
    /// # Errors
    ///
    /// Same conditions as
    /// [`Self::compute_posterior_parameters_kg`].
    pub fn compute_posterior_parameters_kg_many_cp(
        &self,
        points: &DMatrix<f64>,
        candidate_points: &DMatrix<f64>,
        options: &KgOptions,
    ) -> Result<KgParametersMany> {
        self.ensure_x_points(points)?;
        self.ensure_domain_points(candidate_points)?;
        let kernel_params = self.gp.kernel_params();
        let factor =
            self.gp.posterior_factor(self.gp.var_noise(), self.gp.mean(), kernel_params, options.cache)?;
        let historical = self.gp.historical_points();
        let n = points.nrows();

        let quad_key = cache::hyper_key(kernel_params);
        let cached_vec_covs = if options.cache {
            self.cache.lock().get(SlotKind::Quadratures, &quad_key)
        } else {
            None
        };
        if let Some(cached) = &cached_vec_covs {
            ensure_size(n, cached.nrows())?;
        }

        let need_vec_covs = cached_vec_covs.is_none();
        let (fresh_vec_covs, b_new, failed_rows) = self.vectors_b_core(
            points,
            candidate_points,
            historical,
            kernel_params,
            need_vec_covs,
            true,
            options.parallel,
        )?;
        if options.cache && need_vec_covs {
            self.cache.lock().put(SlotKind::Quadratures, quad_key.clone(), fresh_vec_covs.clone());
        }
        let vec_covs = cached_vec_covs.unwrap_or(fresh_vec_covs);

        let a = self.posterior_mean_vector(&vec_covs, &factor, &quad_key, n, options.cache);

        let cross_cov = self.gp.evaluate_cross_cov(historical, candidate_points, kernel_params);
        let solve_2 = factor.chol.solve(&cross_cov);
        let mut b = &b_new - &vec_covs * &solve_2;
        for j in 0..candidate_points.nrows() {
            let candidate = candidate_points.row(j).transpose();
            let candidate_matrix = row_matrix(&candidate);
            let self_cov = self
                .gp
                .evaluate_cross_cov(&candidate_matrix, &candidate_matrix, kernel_params)[(0, 0)];
            let denominator =
                (self_cov - cross_cov.column(j).dot(&solve_2.column(j))).max(0.0).sqrt();
            for i in 0..n {
                b[(i, j)] /= denominator;
            }
        }

        Ok(KgParametersMany { a, b, failed_rows })
    }

    fn posterior_mean_vector(
        &self,
        vec_covs: &DMatrix<f64>,
        factor: &PosteriorFactor,
        quad_key: &[u64],
        n: usize,
        cache: bool,
    ) -> DVector<f64> {
        if cache {
            let cached = self.cache.lock().get(SlotKind::PosteriorMean, quad_key);
            if let Some(cached) = cached
                && cached.nrows() == n
            {
                return cached.column(0).clone_owned();
            }
        }
        let a = (vec_covs * &factor.solve).add_scalar(self.gp.mean());
        if cache {
            self.cache.lock().put(
                SlotKind::PosteriorMean,
                quad_key.to_vec(),
                DMatrix::from_column_slice(a.len(), 1, a.as_slice()),
            );
        }
        a
    }

    /// Gradient of the `b` vector with respect to the candidate, one
    /// `dimension`-length row per discretization point.
    ///
    /// With `keep_indexes` set, cached matrices computed over a larger
    /// discretization are restricted to the given rows; the passed
    /// `points` must be exactly that subset. Fresh computations always
    /// run over `points` as passed. The gradient of `k(z, z)` with
    /// respect to `z` is zero for the stationary kernels the engine
    /// uses, and the decomposition relies on that.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for wrongly shaped inputs
    /// or a selection that does not match `points`,
    /// [`Error::NonPositiveDefinite`] when the surrogate prior cannot
    /// be factored, and [`Error::PartialComputation`] when rows failed
    /// under a strict fill policy.
    pub fn gradient_vector_b(
        &self,
        candidate_point: &DVector<f64>,
        points: &DMatrix<f64>,
        options: &GradientBOptions,
    ) -> Result<DMatrix<f64>> {
        self.ensure_x_points(points)?;
        self.ensure_domain_point(candidate_point)?;
        let kernel_params = self.gp.kernel_params();
        let factor =
            self.gp.posterior_factor(self.gp.var_noise(), self.gp.mean(), kernel_params, options.cache)?;
        let historical = self.gp.historical_points();
        let dimension = self.gp.dimension();
        let n = points.nrows();

        let candidate_matrix = row_matrix(candidate_point);
        let gamma = self.gp.evaluate_cross_cov(historical, &candidate_matrix, kernel_params);
        let gamma_vec = gamma.column(0).clone_owned();
        let grad_gamma = self.gp.evaluate_grad_cross_cov_respect_point(
            candidate_point,
            historical,
            kernel_params,
        );
        let grad_b_new = self.evaluate_grad_quadrature_cross_cov_resp_candidate(
            candidate_point,
            points,
            kernel_params,
        );

        let solve_1 = factor.chol.solve(&gamma_vec);
        let self_cov = self.gp.evaluate_cov(&candidate_matrix, kernel_params)[(0, 0)];
        let beta_1 = (self_cov - gamma_vec.dot(&solve_1)).powf(-0.5);

        let quad_key = cache::hyper_key(kernel_params);
        let b_key = cache::hyper_point_key(kernel_params, candidate_point.as_slice());
        let (cached_vec_covs, cached_b_new) = if options.cache {
            let guard = self.cache.lock();
            (
                guard.get(SlotKind::Quadratures, &quad_key),
                guard.get(SlotKind::CandidateCrossCov, &b_key),
            )
        } else {
            (None, None)
        };

        let need_vec_covs = cached_vec_covs.is_none();
        let need_b_new = cached_b_new.is_none();
        let (fresh_vec_covs, fresh_b_new, _failed) = if need_vec_covs || need_b_new {
            self.vectors_b_core(
                points,
                &candidate_matrix,
                historical,
                kernel_params,
                need_vec_covs,
                need_b_new,
                options.parallel,
            )?
        } else {
            (DMatrix::zeros(0, 0), DMatrix::zeros(0, 0), Vec::new())
        };
        if options.cache {
            let mut guard = self.cache.lock();
            if need_vec_covs {
                guard.put(SlotKind::Quadratures, quad_key, fresh_vec_covs.clone());
            }
            if need_b_new {
                guard.put(SlotKind::CandidateCrossCov, b_key, fresh_b_new.clone());
            }
        }
        // selection applies to cached matrices only; fresh ones were
        // already computed over the passed points
        let vec_covs = match cached_vec_covs {
            Some(cached) => select_active_rows(cached, options.keep_indexes.as_deref(), n)?,
            None => fresh_vec_covs,
        };
        let b_new = match cached_b_new {
            Some(cached) => select_active_rows(cached, options.keep_indexes.as_deref(), n)?,
            None => fresh_b_new,
        };

        let solve_2 = factor.chol.solve(&vec_covs.transpose());
        let beta_2 = b_new.column(0).clone_owned() - &vec_covs * &solve_1;
        let beta_3 = &grad_b_new - grad_gamma.transpose() * &solve_2;
        let beta_4 = grad_gamma.transpose() * &solve_1 * 2.0;
        // k(z, z) is constant for a stationary kernel, so its gradient
        // with respect to the candidate drops out
        let beta_5 = 0.0;

        let gradients = DMatrix::from_fn(dimension, n, |i, j| {
            beta_1 * beta_3[(i, j)] - 0.5 * beta_1.powi(3) * beta_2[j] * (beta_5 - beta_4[i])
        });
        Ok(gradients.transpose())
    }

    // -----------------------------------------------------------------
    // Posterior-mean optimization
    // -----------------------------------------------------------------

    /// Optimize the posterior mean of `g` over the decision box.
    ///
    /// The starting point is, in order of preference: the `start`
    /// argument, the solution of the previous run in the log, or a
    /// seeded uniform draw from the box. The result is appended to the
    /// optimization log, so successive calls resume from each other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for a wrongly sized start,
    /// [`Error::NonPositiveDefinite`] when the surrogate prior cannot
    /// be factored, and [`Error::Solver`] when the optimizer fails.
    pub fn optimize_posterior_mean(
        &self,
        start: Option<&DVector<f64>>,
        random_seed: Option<u64>,
        direction: Direction,
    ) -> Result<OptimizeResult> {
        let bounds = self.x_bounds();
        let start_point: Vec<f64> = match start {
            Some(point) => {
                self.ensure_x_point(point)?;
                point.iter().copied().collect()
            }
            None => {
                let previous = self.optimal_solutions.lock().last().map(|r| r.solution.clone());
                match previous {
                    Some(solution) => solution,
                    None => {
                        let mut rng = rng_util::rng_from_seed(random_seed);
                        bounds
                            .iter()
                            .map(|&(low, high)| rng_util::f64_range(&mut rng, low, high))
                            .collect()
                    }
                }
            }
        };

        let n_x = self.partition.n_x();
        let objective = |x: &[f64]| -> Result<f64> {
            let point = DMatrix::from_row_slice(1, n_x, x);
            let posterior = self.compute_posterior_parameters(
                &point,
                &PosteriorOptions { only_mean: true, cache: true, parallel: false },
            )?;
            Ok(posterior.mean[0])
        };
        let gradient = |x: &[f64]| -> Result<Vec<f64>> {
            let point = DVector::from_column_slice(x);
            let grad = self.gradient_posterior_mean(&point, true)?;
            Ok(grad.iter().copied().collect())
        };

        let result = optimize::optimize_bounded(
            &objective,
            &gradient,
            &bounds,
            &start_point,
            direction,
            self.max_optimizer_iters,
        )?;
        info!(
            value = result.optimal_value,
            iterations = result.iterations,
            status = %result.status,
            "optimized the posterior mean"
        );
        self.optimal_solutions.lock().push(result.clone());
        Ok(result)
    }

    /// Draw observations of `g` at one decision point from its
    /// posterior.
    ///
    /// A negative posterior variance (numerical noise around zero) is
    /// floored at zero, collapsing the draws onto the mean.
    ///
    /// # Errors
    ///
    /// Same conditions as
    /// [`Self::compute_posterior_parameters`] for a single point.
    pub fn sample_new_observations(
        &self,
        point: &DVector<f64>,
        n_samples: usize,
        random_seed: Option<u64>,
    ) -> Result<DVector<f64>> {
        let point_matrix = DMatrix::from_row_slice(1, point.len(), point.as_slice());
        let posterior =
            self.compute_posterior_parameters(&point_matrix, &PosteriorOptions::default())?;
        let mean = posterior.mean[0];
        let std = posterior.cov.unwrap_or(0.0).max(0.0).sqrt();
        let mut rng = rng_util::rng_from_seed(random_seed);
        Ok(DVector::from_fn(n_samples, |_, _| {
            mean + std * rng_util::standard_normal(&mut rng)
        }))
    }

    // -----------------------------------------------------------------
    // Debug artifacts
    // -----------------------------------------------------------------

    /// Write the posterior-mean optimization log under
    /// `<debug_dir>/<problem>/`, returning the file path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the file cannot be written.
    pub fn write_debug_data(&self, debug_dir: &Path, key: &RunKey) -> Result<PathBuf> {
        let kernel_name = report::kernel_name(&self.gp.kernel_components());
        let path = key.problem_dir(debug_dir).join(key.optimal_solutions_file(&kernel_name));
        let solutions = self.optimal_solutions();
        report::write_json(&solutions, &path)?;
        debug!(path = %path.display(), entries = solutions.len(), "wrote the optimization log");
        Ok(path)
    }

    /// Evaluate the posterior mean over a grid of the decision box and
    /// write both the grid and the values as debug artifacts.
    ///
    /// The grid is read from the points file when one exists (so every
    /// iteration shares the same grid) and generated and written
    /// otherwise. Without explicit counts, each axis gets ten points
    /// per unit of width, at least one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] when explicit counts do not
    /// match the decision dimensions, [`Error::Storage`] on artifact
    /// IO, and the [`Self::compute_posterior_parameters`] conditions
    /// for the evaluation itself.
    pub fn generate_evaluations(
        &self,
        debug_dir: &Path,
        key: &RunKey,
        iteration: u64,
        n_points_by_dimension: Option<&[usize]>,
    ) -> Result<GridEvaluations> {
        let kernel_name = report::kernel_name(&self.gp.kernel_components());
        let problem_dir = key.problem_dir(debug_dir);
        let points_path = problem_dir.join(key.grid_points_file(&kernel_name));
        let x_bounds = self.x_bounds();
        let n_x = self.partition.n_x();

        let points: Vec<Vec<f64>> = match report::read_json(&points_path)? {
            Some(points) => points,
            None => {
                let counts: Vec<usize> = match n_points_by_dimension {
                    Some(counts) => {
                        ensure_size(x_bounds.len(), counts.len())?;
                        counts.iter().map(|&count| count.max(1)).collect()
                    }
                    None => x_bounds
                        .iter()
                        .map(|&(low, high)| default_grid_points(low, high))
                        .collect(),
                };
                let axes: Vec<Vec<f64>> = x_bounds
                    .iter()
                    .zip(&counts)
                    .map(|(&(low, high), &count)| report::linspace(low, high, count))
                    .collect();
                let points = report::cartesian_product(&axes);
                report::write_json(&points, &points_path)?;
                points
            }
        };
        if let Some(row) = points.iter().find(|row| row.len() != n_x) {
            return Err(Error::DimensionMismatch { expected: n_x, got: row.len() });
        }

        let matrix = DMatrix::from_fn(points.len(), n_x, |i, j| points[i][j]);
        let posterior = self.compute_posterior_parameters(
            &matrix,
            &PosteriorOptions { only_mean: true, cache: true, parallel: true },
        )?;
        let grid = GridEvaluations {
            points,
            evaluations: posterior.mean.iter().copied().collect(),
        };
        let evaluations_path = problem_dir.join(key.evaluations_file(&kernel_name, iteration));
        report::write_json(&grid, &evaluations_path)?;
        debug!(
            path = %evaluations_path.display(),
            points = grid.points.len(),
            iteration,
            "wrote posterior-mean evaluations"
        );
        Ok(grid)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_size(expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { expected, got })
    }
}

fn finite_row(values: DVector<f64>, row: usize) -> Result<DVector<f64>> {
    if values.iter().copied().all(f64::is_finite) {
        Ok(values)
    } else {
        Err(Error::NonFiniteRow { row })
    }
}

fn fill_row(target: &mut DMatrix<f64>, row: usize, values: &DVector<f64>) {
    for (column, &value) in values.iter().enumerate() {
        target[(row, column)] = value;
    }
}

fn row_matrix(point: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_row_slice(1, point.len(), point.as_slice())
}

fn select_active_rows(
    cached: DMatrix<f64>,
    keep_indexes: Option<&[usize]>,
    expected: usize,
) -> Result<DMatrix<f64>> {
    let selected = match keep_indexes {
        Some(keep) => {
            if let Some(&out_of_range) = keep.iter().find(|&&index| index >= cached.nrows()) {
                return Err(Error::DimensionMismatch {
                    expected: cached.nrows(),
                    got: out_of_range,
                });
            }
            crate::linalg::select_rows(&cached, keep)
        }
        None => cached,
    };
    ensure_size(expected, selected.nrows())?;
    Ok(selected)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn default_grid_points(low: f64, high: f64) -> usize {
    (((high - low) * 10.0).round()).max(1.0) as usize
}
