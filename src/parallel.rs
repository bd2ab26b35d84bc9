//! Row-wise dispatch with an explicit policy for failed rows.
//!
//! The batched posterior computations evaluate one independent row per
//! discretization point. Rows run sequentially or on the rayon pool,
//! and a failed row is handled according to the engine's
//! [`FillPolicy`] instead of silently producing a partial result.

use rayon::prelude::*;
use tracing::warn;

use crate::error::{Error, Result};

/// What to do when a row of a batched computation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FillPolicy {
    /// Log the failure, leave the row zero-filled, and report its index
    /// in the result summary.
    #[default]
    Zero,
    /// Retry the row sequentially up to the given number of attempts,
    /// then fail the whole computation if it still errors.
    Retry(usize),
    /// Fail the whole computation on any failed row.
    Abort,
}

/// Run `worker` for every index, collecting per-row results in order.
///
/// Returns the row values (`None` for rows zero-filled under
/// [`FillPolicy::Zero`]) together with the indices of the failed rows.
///
/// # Errors
///
/// Returns [`Error::PartialComputation`] when rows failed and the
/// policy does not allow zero-filling them.
pub(crate) fn run_with_policy<T, F>(
    parallel: bool,
    policy: FillPolicy,
    n: usize,
    worker: F,
) -> Result<(Vec<Option<T>>, Vec<usize>)>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync,
{
    let results: Vec<Result<T>> = if parallel {
        (0..n).into_par_iter().map(&worker).collect()
    } else {
        (0..n).map(&worker).collect()
    };

    let mut rows = Vec::with_capacity(n);
    let mut failed = Vec::new();
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => rows.push(Some(value)),
            Err(error) => {
                if let FillPolicy::Retry(attempts) = policy
                    && let Some(value) = retry_row(&worker, i, attempts)
                {
                    rows.push(Some(value));
                    continue;
                }
                if matches!(policy, FillPolicy::Zero) {
                    warn!(row = i, %error, "row computation failed, leaving the row zeroed");
                }
                rows.push(None);
                failed.push(i);
            }
        }
    }

    if failed.is_empty() || matches!(policy, FillPolicy::Zero) {
        Ok((rows, failed))
    } else {
        Err(Error::PartialComputation { failed })
    }
}

fn retry_row<T, F>(worker: &F, index: usize, attempts: usize) -> Option<T>
where
    F: Fn(usize) -> Result<T>,
{
    for _ in 0..attempts {
        if let Ok(value) = worker(index) {
            return Some(value);
        }
    }
    None
}
