#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Bayesian quadrature engine for optimizing the expectation of an
//! expensive function over a task variable. A Gaussian process models
//! `f(x, w)` on the full domain, and the engine works directly with the
//! implied posterior of `g(x) = E_w[f(x, w)]`: posterior means,
//! variances and gradients, the knowledge-gradient ingredients for
//! choosing the next `(x, w)` observation, and an L-BFGS driver that
//! optimizes the posterior mean over the decision box.
//!
//! # Getting Started
//!
//! Model three observations of `f(x, w)` and query the posterior of
//! `g(x)` averaged over two tasks:
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use sbo::prelude::*;
//!
//! let gp = GpModel::builder()
//!     .kernel(Kernel::Matern52)
//!     .kernel_params(vec![1.0, 1.0, 1.0])
//!     .bounds(vec![(0.0, 1.0), (0.0, 1.0)])
//!     .training_data(
//!         DMatrix::from_row_slice(3, 2, &[0.1, 0.0, 0.5, 1.0, 0.9, 0.0]),
//!         DVector::from_column_slice(&[0.4, -0.2, 0.7]),
//!     )
//!     .build()?;
//!
//! let partition = DomainPartition::from_x_domain(2, vec![0])?;
//! let tasks = TaskDistribution::finite_uniform(2)?;
//! let engine = BayesianQuadrature::new(std::sync::Arc::new(gp), partition, tasks)?;
//!
//! let posterior = engine.compute_posterior_parameters(
//!     &DMatrix::from_row_slice(1, 1, &[0.3]),
//!     &PosteriorOptions::default(),
//! )?;
//! println!("g(0.3) = {:.4}, var = {:.6}", posterior.mean[0], posterior.cov.unwrap_or(0.0));
//! # Ok::<(), Error>(())
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`BayesianQuadrature`] | Posterior of `g`: means, variances, gradients, knowledge-gradient vectors, optimization. |
//! | [`GpModel`](gp::GpModel) | Gaussian-process surrogate of `f` with a cached Cholesky factor; any [`CovarianceProvider`](gp::CovarianceProvider) can stand in. |
//! | [`Kernel`](kernel::Kernel) | Stationary covariance family: squared exponential or Matern 5/2. |
//! | [`DomainPartition`](distribution::DomainPartition) | Which coordinates of the domain belong to `x` and which to `w`. |
//! | [`TaskDistribution`](distribution::TaskDistribution) | Closed-form expectations over the task variable. |
//! | [`FillPolicy`](parallel::FillPolicy) | What happens when a row of a batched computation fails. |
//! | [`RunKey`](report::RunKey) | Names the JSON debug artifacts of one optimization run. |

mod cache;
pub mod distribution;
mod error;
pub mod gp;
pub mod kernel;
mod linalg;
pub mod optimize;
pub mod parallel;
pub mod quadrature;
pub mod report;
mod rng_util;
mod types;

pub use error::{Error, Result};
pub use gp::{CovarianceProvider, GpModel};
pub use quadrature::BayesianQuadrature;
pub use types::Direction;

/// Convenient wildcard import for the most common types.
///
/// ```
/// use sbo::prelude::*;
/// ```
pub mod prelude {
    pub use crate::distribution::{DomainPartition, TaskDistribution};
    pub use crate::error::{Error, Result};
    pub use crate::gp::{CovarianceProvider, GpModel, GpModelBuilder, PosteriorFactor};
    pub use crate::kernel::Kernel;
    pub use crate::optimize::OptimizeResult;
    pub use crate::parallel::FillPolicy;
    pub use crate::quadrature::{
        BayesianQuadrature, GradientBOptions, KgOptions, KgParameters, KgParametersMany,
        PosteriorOptions, PosteriorParameters, VectorsB,
    };
    pub use crate::report::{GridEvaluations, RunKey};
    pub use crate::types::Direction;
}
