//! Domain partition and the expectation operators of the task variable.
//!
//! The objective `g(x) = E_w[f(x, w)]` averages an expensive function
//! over a task variable `w` that occupies some coordinates of the full
//! domain. [`DomainPartition`] records which coordinate indices belong
//! to the decision variable `x` and which to `w`;
//! [`TaskDistribution`] turns kernel evaluations on the full domain
//! into quadrature values on the `x` projection by averaging over the
//! task draws.
//!
//! All four operators substitute every task draw into the `w` slots of
//! a decision point, apply the wrapped covariance evaluation to the
//! substituted rows, and average the result. Gradients are averaged the
//! same way and then restricted to the `x` coordinates, since the task
//! slots of a substituted point do not move with `x`.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Domain partition
// ---------------------------------------------------------------------------

/// Split of the domain coordinates into decision and task indices.
///
/// Both index sets are strictly increasing, disjoint, and together
/// cover `0..dimension`. Instances are validated on construction so the
/// expectation operators can index without further checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainPartition {
    dimension: usize,
    x: Vec<usize>,
    w: Vec<usize>,
}

impl DomainPartition {
    /// Build a partition from explicit `x` and `w` index sets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPartition`] when an index is out of
    /// range, a set is not strictly increasing, the sets overlap, the
    /// sets leave a coordinate uncovered, or `x` is empty.
    pub fn new(dimension: usize, x: Vec<usize>, w: Vec<usize>) -> Result<Self> {
        if dimension == 0 {
            return Err(invalid("domain must have at least one dimension"));
        }
        if x.is_empty() {
            return Err(invalid("x index set is empty"));
        }
        check_strictly_increasing(&x, "x")?;
        check_strictly_increasing(&w, "w")?;

        let mut owner = vec![false; dimension];
        for &index in x.iter().chain(w.iter()) {
            if index >= dimension {
                return Err(Error::InvalidPartition {
                    reason: format!("index {index} out of range for dimension {dimension}"),
                });
            }
            if owner[index] {
                return Err(Error::InvalidPartition {
                    reason: format!("index {index} appears in both x and w"),
                });
            }
            owner[index] = true;
        }
        if x.len() + w.len() != dimension {
            return Err(Error::InvalidPartition {
                reason: format!(
                    "index sets cover {} of {dimension} dimensions",
                    x.len() + w.len()
                ),
            });
        }
        Ok(Self { dimension, x, w })
    }

    /// Build a partition from the `x` indices alone; `w` is the
    /// complement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPartition`] under the same conditions as
    /// [`DomainPartition::new`].
    pub fn from_x_domain(dimension: usize, x: Vec<usize>) -> Result<Self> {
        if x.iter().any(|&index| index >= dimension) {
            return Err(Error::InvalidPartition {
                reason: format!("x index out of range for dimension {dimension}"),
            });
        }
        let w = (0..dimension).filter(|index| !x.contains(index)).collect();
        Self::new(dimension, x, w)
    }

    /// Number of coordinates of the full domain.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Decision-variable coordinate indices, strictly increasing.
    #[must_use]
    pub fn x(&self) -> &[usize] {
        &self.x
    }

    /// Task-variable coordinate indices, strictly increasing.
    #[must_use]
    pub fn w(&self) -> &[usize] {
        &self.w
    }

    /// Number of decision coordinates.
    #[must_use]
    pub fn n_x(&self) -> usize {
        self.x.len()
    }

    /// Number of task coordinates.
    #[must_use]
    pub fn n_w(&self) -> usize {
        self.w.len()
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidPartition { reason: reason.to_string() }
}

fn check_strictly_increasing(indexes: &[usize], label: &str) -> Result<()> {
    if indexes.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(Error::InvalidPartition {
            reason: format!("{label} indices must be strictly increasing"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Task distribution
// ---------------------------------------------------------------------------

/// Distribution of the task variable, with closed-form expectations.
///
/// The finite uniform family places equal weight on the task indices
/// `0..n_tasks`, so every expectation is an exact average over the
/// substituted draws rather than a Monte Carlo estimate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskDistribution {
    /// Uniform weight over the integer task indices `0..n_tasks`.
    FiniteUniform {
        /// Number of tasks.
        n_tasks: usize,
    },
}

impl TaskDistribution {
    /// Uniform distribution over `n_tasks` integer tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTaskSet`] when `n_tasks` is zero.
    pub fn finite_uniform(n_tasks: usize) -> Result<Self> {
        if n_tasks == 0 {
            return Err(Error::EmptyTaskSet);
        }
        Ok(Self::FiniteUniform { n_tasks })
    }

    /// Number of task draws the expectations average over.
    #[must_use]
    pub fn n_tasks(&self) -> usize {
        match self {
            Self::FiniteUniform { n_tasks } => *n_tasks,
        }
    }

    /// Check that this distribution can drive the given partition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDistribution`] when the partition's task
    /// block does not match what the distribution substitutes. The
    /// finite uniform family fills exactly one `w` coordinate.
    pub fn validate_partition(&self, partition: &DomainPartition) -> Result<()> {
        match self {
            Self::FiniteUniform { .. } => {
                if partition.n_w() == 1 {
                    Ok(())
                } else {
                    Err(Error::InvalidDistribution {
                        reason: format!(
                            "finite uniform tasks need exactly one w coordinate, partition has {}",
                            partition.n_w()
                        ),
                    })
                }
            }
        }
    }

    /// Substitute every task draw into `x_point`, producing one full
    /// domain row per task.
    #[must_use]
    pub fn substitute(&self, x_point: &DVector<f64>, partition: &DomainPartition) -> DMatrix<f64> {
        match self {
            Self::FiniteUniform { n_tasks } => {
                debug_assert_eq!(x_point.len(), partition.n_x());
                debug_assert_eq!(partition.n_w(), 1);
                let w_index = partition.w()[0];
                let mut rows = DMatrix::zeros(*n_tasks, partition.dimension());
                for task in 0..*n_tasks {
                    for (slot, &index) in partition.x().iter().enumerate() {
                        rows[(task, index)] = x_point[slot];
                    }
                    rows[(task, w_index)] = task_value(task);
                }
                rows
            }
        }
    }

    /// Single expectation `E_w[f(substitute(x, w))]`.
    ///
    /// `f` maps the substituted rows (`n_tasks x dimension`) to a
    /// matrix with one row per task; the result is the column-wise
    /// average, a vector of length `f`'s column count.
    #[must_use]
    pub fn expectation<F>(
        &self,
        f: F,
        x_point: &DVector<f64>,
        partition: &DomainPartition,
    ) -> DVector<f64>
    where
        F: FnOnce(&DMatrix<f64>) -> DMatrix<f64>,
    {
        match self {
            Self::FiniteUniform { n_tasks } => {
                let substituted = self.substitute(x_point, partition);
                let values = f(&substituted);
                debug_assert_eq!(values.nrows(), *n_tasks);
                let scale = 1.0 / divisor(*n_tasks);
                DVector::from_fn(values.ncols(), |j, _| values.column(j).sum() * scale)
            }
        }
    }

    /// Double expectation `E_{w,w'}[f(substitute(x, w), substitute(x, w'))]`.
    ///
    /// `f` maps the substituted rows to their pairwise covariance
    /// matrix (`n_tasks x n_tasks`); the result averages every entry,
    /// so the identical draws on the diagonal contribute like any other
    /// pair.
    #[must_use]
    pub fn double_expectation<F>(
        &self,
        f: F,
        x_point: &DVector<f64>,
        partition: &DomainPartition,
    ) -> f64
    where
        F: FnOnce(&DMatrix<f64>) -> DMatrix<f64>,
    {
        match self {
            Self::FiniteUniform { n_tasks } => {
                let substituted = self.substitute(x_point, partition);
                let values = f(&substituted);
                debug_assert_eq!(values.nrows(), *n_tasks);
                debug_assert_eq!(values.ncols(), *n_tasks);
                values.sum() / (divisor(*n_tasks) * divisor(*n_tasks))
            }
        }
    }

    /// Gradient of the single expectation with respect to `x`.
    ///
    /// `grad_f` maps one substituted row (a full domain point) to an
    /// `m x dimension` matrix of gradients. The averaged gradient is
    /// restricted to the `x` columns (the task slots do not move with
    /// `x`) and returned transposed as `n_x x m`.
    #[must_use]
    pub fn gradient_expectation<G>(
        &self,
        grad_f: G,
        x_point: &DVector<f64>,
        partition: &DomainPartition,
    ) -> DMatrix<f64>
    where
        G: Fn(&DVector<f64>) -> DMatrix<f64>,
    {
        match self {
            Self::FiniteUniform { n_tasks } => {
                let substituted = self.substitute(x_point, partition);
                // n_tasks >= 1 by construction
                let mut mean = grad_f(&substituted.row(0).transpose());
                for task in 1..*n_tasks {
                    mean += grad_f(&substituted.row(task).transpose());
                }
                let mean = mean / divisor(*n_tasks);
                DMatrix::from_fn(partition.n_x(), mean.nrows(), |i, j| {
                    mean[(j, partition.x()[i])]
                })
            }
        }
    }

    /// Per-point candidate gradients of the quadrature cross-covariance.
    ///
    /// For each row of `points` (decision coordinates only), `grad_f`
    /// maps the substituted rows to an `n_tasks x dimension` matrix of
    /// gradients with respect to the candidate; the result averages
    /// over tasks and collects one `dimension`-length column per point.
    #[must_use]
    pub fn gradient_expectation_resp_candidate<G>(
        &self,
        grad_f: G,
        points: &DMatrix<f64>,
        partition: &DomainPartition,
    ) -> DMatrix<f64>
    where
        G: Fn(&DMatrix<f64>) -> DMatrix<f64>,
    {
        match self {
            Self::FiniteUniform { n_tasks } => {
                let scale = 1.0 / divisor(*n_tasks);
                let mut out = DMatrix::zeros(partition.dimension(), points.nrows());
                for point in 0..points.nrows() {
                    let x_point = points.row(point).transpose();
                    let substituted = self.substitute(&x_point, partition);
                    let grads = grad_f(&substituted);
                    debug_assert_eq!(grads.nrows(), *n_tasks);
                    for coord in 0..partition.dimension() {
                        out[(coord, point)] = grads.column(coord).sum() * scale;
                    }
                }
                out
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn divisor(n_tasks: usize) -> f64 {
    n_tasks as f64
}

#[allow(clippy::cast_precision_loss)]
fn task_value(task: usize) -> f64 {
    task as f64
}
