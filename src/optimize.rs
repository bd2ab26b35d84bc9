//! Bounded quasi-Newton optimization of a smooth objective.
//!
//! argmin's L-BFGS works on an unconstrained parameter, so box bounds
//! are enforced through a sigmoid reparameterization: the solver moves
//! in an unbounded `z`, the objective sees
//! `x_i = low_i + (high_i - low_i) * sigmoid(z_i)`, and gradients are
//! mapped with the chain rule. Maximization negates the cost and
//! gradient on the way in and the reported value on the way out.

use std::collections::HashMap;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Direction;

/// History length of the L-BFGS inverse-Hessian approximation.
const LBFGS_MEMORY: usize = 7;

/// Margin keeping boundary starts inside the open unit interval before
/// the logit.
const LOGIT_GUARD: f64 = 1e-10;

/// Outcome of one bounded optimization run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    /// Starting point, in the original bounded coordinates.
    pub start: Vec<f64>,
    /// Best point found, in the original bounded coordinates.
    pub solution: Vec<f64>,
    /// Objective value at the solution (sign corrected for
    /// maximization).
    pub optimal_value: f64,
    /// Objective gradient at the solution, in bounded coordinates.
    pub gradient: Vec<f64>,
    /// Iterations the solver ran.
    pub iterations: u64,
    /// Objective evaluations consumed.
    pub cost_evaluations: u64,
    /// Gradient evaluations consumed.
    pub gradient_evaluations: u64,
    /// Whether the solver reached its convergence tolerance.
    pub converged: bool,
    /// The solver's termination reason, verbatim.
    pub status: String,
}

struct BoundedProblem<'a, F, G> {
    objective: &'a F,
    gradient: &'a G,
    bounds: &'a [(f64, f64)],
    sign: f64,
}

impl<F, G> CostFunction for BoundedProblem<'_, F, G>
where
    F: Fn(&[f64]) -> Result<f64>,
    G: Fn(&[f64]) -> Result<Vec<f64>>,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> core::result::Result<f64, argmin::core::Error> {
        let x = to_bounded(param, self.bounds);
        let value = (self.objective)(&x).map_err(argmin::core::Error::from)?;
        Ok(self.sign * value)
    }
}

impl<F, G> Gradient for BoundedProblem<'_, F, G>
where
    F: Fn(&[f64]) -> Result<f64>,
    G: Fn(&[f64]) -> Result<Vec<f64>>,
{
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> core::result::Result<Vec<f64>, argmin::core::Error> {
        let x = to_bounded(param, self.bounds);
        let grad_x = (self.gradient)(&x).map_err(argmin::core::Error::from)?;
        let grad_z = param
            .iter()
            .zip(self.bounds)
            .zip(&grad_x)
            .map(|((&z, &(low, high)), &g)| {
                let s = sigmoid(z);
                self.sign * g * (high - low) * s * (1.0 - s)
            })
            .collect();
        Ok(grad_z)
    }
}

/// Minimize or maximize `objective` over a box via L-BFGS.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] when `start` and `bounds`
/// disagree, [`Error::Solver`] when the solver fails or returns no
/// parameter, and any error raised by the objective or gradient
/// closures.
pub(crate) fn optimize_bounded<F, G>(
    objective: &F,
    gradient: &G,
    bounds: &[(f64, f64)],
    start: &[f64],
    direction: Direction,
    max_iters: u64,
) -> Result<OptimizeResult>
where
    F: Fn(&[f64]) -> Result<f64>,
    G: Fn(&[f64]) -> Result<Vec<f64>>,
{
    if start.len() != bounds.len() {
        return Err(Error::DimensionMismatch { expected: bounds.len(), got: start.len() });
    }

    let sign = direction.cost_sign();
    let problem = BoundedProblem { objective, gradient, bounds, sign };
    let solver = LBFGS::new(MoreThuenteLineSearch::new(), LBFGS_MEMORY);
    let initial = to_unbounded(start, bounds);

    let executor = Executor::new(problem, solver)
        .configure(|state| state.param(initial).max_iters(max_iters));
    let mut state = executor.run().map_err(|e| Error::Solver(e.to_string()))?.state().clone();

    let iterations = state.get_iter();
    let counts: HashMap<String, u64> = state.get_func_counts().clone();
    let termination = state.get_termination_status().clone();
    let best_cost = state.get_best_cost();
    let best = state
        .take_best_param()
        .ok_or_else(|| Error::Solver("solver returned no parameter".to_string()))?;

    let solution = to_bounded(&best, bounds);
    // report the true objective gradient at the solution, not the
    // solver's internal reparameterized one
    let gradient_at_solution = gradient(&solution)?;

    let converged = matches!(
        termination,
        TerminationStatus::Terminated(
            TerminationReason::SolverConverged | TerminationReason::TargetCostReached
        )
    );
    let status = match &termination {
        TerminationStatus::Terminated(reason) => reason.to_string(),
        TerminationStatus::NotTerminated => "not terminated".to_string(),
    };

    Ok(OptimizeResult {
        start: start.to_vec(),
        solution,
        optimal_value: sign * best_cost,
        gradient: gradient_at_solution,
        iterations,
        cost_evaluations: counts.get("cost_count").copied().unwrap_or(0),
        gradient_evaluations: counts.get("gradient_count").copied().unwrap_or(0),
        converged,
        status,
    })
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn to_bounded(z: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    z.iter()
        .zip(bounds)
        .map(|(&z_i, &(low, high))| low + (high - low) * sigmoid(z_i))
        .collect()
}

fn to_unbounded(x: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    x.iter()
        .zip(bounds)
        .map(|(&x_i, &(low, high))| {
            let fraction = ((x_i - low) / (high - low)).clamp(LOGIT_GUARD, 1.0 - LOGIT_GUARD);
            (fraction / (1.0 - fraction)).ln()
        })
        .collect()
}
