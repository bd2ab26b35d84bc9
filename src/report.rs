//! Debug artifacts of an optimization run.
//!
//! Artifacts are grouped under `<debug_dir>/<problem_name>/` and named
//! by a [`RunKey`], so several configurations of the same problem can
//! write side by side. All files are plain JSON.

use std::fs;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of one optimization run, used to name its artifacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunKey {
    /// Problem being optimized.
    pub problem_name: String,
    /// Surrogate model family.
    pub model_type: String,
    /// Name of the training-data source.
    pub training_name: String,
    /// Number of training observations.
    pub n_training: usize,
    /// Seed the run was started with.
    pub random_seed: u64,
}

impl RunKey {
    /// Directory holding this problem's artifacts.
    #[must_use]
    pub fn problem_dir(&self, debug_dir: &Path) -> PathBuf {
        debug_dir.join(&self.problem_name)
    }

    /// File collecting the posterior-mean optimization log.
    #[must_use]
    pub fn optimal_solutions_file(&self, kernel_name: &str) -> String {
        format!("opt_post_mean_gp_{}.json", self.suffix(kernel_name))
    }

    /// File holding the shared evaluation grid.
    #[must_use]
    pub fn grid_points_file(&self, kernel_name: &str) -> String {
        format!("points_for_post_mean_gp_{}.json", self.suffix(kernel_name))
    }

    /// File holding the posterior-mean values of one iteration.
    #[must_use]
    pub fn evaluations_file(&self, kernel_name: &str, iteration: u64) -> String {
        format!("{iteration}_post_mean_gp_{}.json", self.suffix(kernel_name))
    }

    fn suffix(&self, kernel_name: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}",
            self.model_type,
            self.problem_name,
            kernel_name,
            self.training_name,
            self.n_training,
            self.random_seed
        )
    }
}

/// Join kernel component names into the form used in filenames.
#[must_use]
pub fn kernel_name(components: &[String]) -> String {
    components.join("_")
}

/// Posterior-mean values over the evaluation grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridEvaluations {
    /// Grid points, decision coordinates only.
    pub points: Vec<Vec<f64>>,
    /// Posterior mean at each grid point.
    pub evaluations: Vec<f64>,
}

/// Serialize `value` as JSON at `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`Error::Storage`] when a directory cannot be created, the
/// file cannot be written, or serialization fails.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
    }
    let file = fs::File::create(path).map_err(|e| Error::Storage(e.to_string()))?;
    serde_json::to_writer(BufWriter::new(file), value).map_err(|e| Error::Storage(e.to_string()))
}

/// Deserialize JSON from `path`; a missing file is `Ok(None)`.
///
/// # Errors
///
/// Returns [`Error::Storage`] when the file exists but cannot be read
/// or parsed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Storage(e.to_string())),
    };
    serde_json::from_str(&contents).map(Some).map_err(|e| Error::Storage(e.to_string()))
}

/// `n` evenly spaced values over `[low, high]`; a single point sits at
/// `low`.
pub(crate) fn linspace(low: f64, high: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![low];
    }
    let step = (high - low) / divisor(n - 1);
    (0..n).map(|i| low + multiplier(i) * step).collect()
}

/// Cartesian product of the axes, rightmost axis varying fastest.
pub(crate) fn cartesian_product(axes: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut rows: Vec<Vec<f64>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(rows.len() * axis.len());
        for prefix in &rows {
            for &value in axis {
                let mut row = prefix.clone();
                row.push(value);
                next.push(row);
            }
        }
        rows = next;
    }
    rows
}

#[allow(clippy::cast_precision_loss)]
fn divisor(n: usize) -> f64 {
    n as f64
}

#[allow(clippy::cast_precision_loss)]
fn multiplier(i: usize) -> f64 {
    i as f64
}
