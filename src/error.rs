#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when a lower bound is not strictly below its upper bound.
    #[error("invalid bounds: low ({low}) must be less than high ({high})")]
    InvalidBounds {
        /// The lower bound value.
        low: f64,
        /// The upper bound value.
        high: f64,
    },

    /// Returned when the decision/task split of the domain is inconsistent.
    #[error("invalid domain partition: {reason}")]
    InvalidPartition {
        /// The reason the partition was rejected.
        reason: String,
    },

    /// Returned when a task distribution is built over zero tasks.
    #[error("task distribution requires at least one task")]
    EmptyTaskSet,

    /// Returned when a task distribution is incompatible with a partition.
    #[error("invalid task distribution: {reason}")]
    InvalidDistribution {
        /// The reason the distribution was rejected.
        reason: String,
    },

    /// Returned when an input has the wrong number of coordinates or rows.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// The expected size.
        expected: usize,
        /// The actual size.
        got: usize,
    },

    /// Returned when the posterior covariance is requested for several points
    /// at once.
    #[error("posterior covariance is only defined for a single point, got {n_points}")]
    MultiPointCovariance {
        /// The number of evaluation points that were passed.
        n_points: usize,
    },

    /// Returned when the prior covariance matrix has no Cholesky factorization.
    #[error("covariance matrix of size {size} is not positive definite")]
    NonPositiveDefinite {
        /// The side length of the offending matrix.
        size: usize,
    },

    /// Returned by a row worker whose result contains NaN or infinity.
    #[error("quadrature row {row} produced a non-finite value")]
    NonFiniteRow {
        /// The index of the failed row.
        row: usize,
    },

    /// Returned when some rows of a batched computation failed and the fill
    /// policy does not allow zero-filling them.
    #[error("computation failed for rows {failed:?}")]
    PartialComputation {
        /// The indices of the rows that failed.
        failed: Vec<usize>,
    },

    /// Returned when the posterior-mean optimizer fails.
    #[error("solver error: {0}")]
    Solver(String),

    /// Returned when reading or writing a debug artifact fails.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = core::result::Result<T, Error>;
