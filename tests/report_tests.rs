//! Integration tests for the debug artifacts: the optimization log and
//! the shared posterior-mean evaluation grid, both stored as JSON under
//! a per-problem directory.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use sbo::Direction;
use sbo::distribution::{DomainPartition, TaskDistribution};
use sbo::gp::GpModel;
use sbo::kernel::Kernel;
use sbo::optimize::OptimizeResult;
use sbo::quadrature::{BayesianQuadrature, PosteriorOptions};
use sbo::report::{GridEvaluations, RunKey, read_json};

fn temp_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("sbo_report_{}_{}_{}", name, process::id(), id))
}

fn engine() -> BayesianQuadrature {
    let gp = GpModel::builder()
        .kernel(Kernel::Matern52)
        .kernel_params(vec![0.7, 0.6, 1.3])
        .bounds(vec![(0.0, 1.0), (0.0, 2.0)])
        .training_data(
            DMatrix::from_row_slice(3, 2, &[0.2, 0.0, 0.5, 1.0, 0.8, 0.3]),
            DVector::from_column_slice(&[1.0, 2.0, 0.5]),
        )
        .var_noise(1e-6)
        .mean(0.25)
        .build()
        .unwrap();
    BayesianQuadrature::new(
        Arc::new(gp),
        DomainPartition::from_x_domain(2, vec![0]).unwrap(),
        TaskDistribution::finite_uniform(2).unwrap(),
    )
    .unwrap()
}

fn run_key() -> RunKey {
    RunKey {
        problem_name: "branin".to_string(),
        model_type: "mtgp".to_string(),
        training_name: "train_a".to_string(),
        n_training: 3,
        random_seed: 5,
    }
}

#[test]
fn the_optimization_log_round_trips_through_json() {
    let dir = temp_dir("log");
    let engine = engine();
    engine.optimize_posterior_mean(None, Some(3), Direction::Maximize).unwrap();
    engine.optimize_posterior_mean(None, None, Direction::Maximize).unwrap();

    let path = engine.write_debug_data(&dir, &run_key()).unwrap();
    assert_eq!(
        path,
        dir.join("branin").join("opt_post_mean_gp_mtgp_branin_matern52_train_a_3_5.json")
    );

    let stored: Vec<OptimizeResult> = read_json(&path).unwrap().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored, engine.optimal_solutions());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn evaluation_grids_are_shared_across_iterations() {
    let dir = temp_dir("grid");
    let engine = engine();
    let key = run_key();

    let first = engine.generate_evaluations(&dir, &key, 0, Some(&[5])).unwrap();
    assert_eq!(first.points.len(), 5);
    assert_eq!(first.evaluations.len(), 5);
    for (i, point) in first.points.iter().enumerate() {
        assert_relative_eq!(point[0], i as f64 / 4.0, epsilon = 1e-12, max_relative = 1e-12);
    }

    // the stored grid wins over a different count on later iterations
    let second = engine.generate_evaluations(&dir, &key, 1, Some(&[9])).unwrap();
    assert_eq!(second.points, first.points);

    let problem_dir = dir.join("branin");
    assert!(problem_dir.join(key.grid_points_file("matern52")).exists());
    assert!(problem_dir.join(key.evaluations_file("matern52", 0)).exists());
    assert!(problem_dir.join(key.evaluations_file("matern52", 1)).exists());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn grid_evaluations_match_the_posterior_mean() {
    let dir = temp_dir("values");
    let engine = engine();
    let key = run_key();

    let grid = engine.generate_evaluations(&dir, &key, 0, Some(&[4])).unwrap();
    let matrix = DMatrix::from_fn(grid.points.len(), 1, |i, _| grid.points[i][0]);
    let direct = engine
        .compute_posterior_parameters(
            &matrix,
            &PosteriorOptions { only_mean: true, cache: false, parallel: false },
        )
        .unwrap();
    for (got, want) in grid.evaluations.iter().zip(direct.mean.iter()) {
        assert_relative_eq!(*got, *want, epsilon = 1e-12, max_relative = 1e-12);
    }

    let stored: GridEvaluations =
        read_json(&dir.join("branin").join(key.evaluations_file("matern52", 0)))
            .unwrap()
            .unwrap();
    assert_eq!(stored, grid);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn default_grid_density_is_ten_points_per_unit() {
    let dir = temp_dir("density");
    let engine = engine();
    // the x box is (0, 1), one unit wide
    let grid = engine.generate_evaluations(&dir, &run_key(), 0, None).unwrap();
    assert_eq!(grid.points.len(), 10);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn grids_cover_every_axis_combination() {
    let dir = temp_dir("cartesian");
    let gp = GpModel::builder()
        .kernel(Kernel::Matern52)
        .kernel_params(vec![0.7, 0.7, 0.6, 1.3])
        .bounds(vec![(0.0, 1.0), (0.0, 2.0), (0.0, 1.0)])
        .build()
        .unwrap();
    let engine = BayesianQuadrature::new(
        Arc::new(gp),
        DomainPartition::from_x_domain(3, vec![0, 1]).unwrap(),
        TaskDistribution::finite_uniform(2).unwrap(),
    )
    .unwrap();

    let grid = engine.generate_evaluations(&dir, &run_key(), 0, Some(&[2, 3])).unwrap();
    assert_eq!(grid.points.len(), 6);
    // rightmost axis varies fastest
    assert_eq!(grid.points[0], vec![0.0, 0.0]);
    assert_eq!(grid.points[1], vec![0.0, 1.0]);
    assert_eq!(grid.points[2], vec![0.0, 2.0]);
    assert_eq!(grid.points[3], vec![1.0, 0.0]);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn explicit_counts_must_cover_every_decision_axis() {
    let dir = temp_dir("counts");
    let engine = engine();
    let err = engine.generate_evaluations(&dir, &run_key(), 0, Some(&[2, 2])).unwrap_err();
    assert!(matches!(err, sbo::Error::DimensionMismatch { expected: 1, got: 2 }), "{err:?}");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn read_json_returns_none_for_a_missing_file() {
    let path = temp_dir("missing").join("nope.json");
    let missing: Option<Vec<f64>> = read_json(&path).unwrap();
    assert!(missing.is_none());
}
