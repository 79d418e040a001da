//! Minimizers and curvature estimates shared by the chi-square and likelihood fitters.
//!
//! The argmin solvers run in a shifted and scaled parameter space
//! `u = (theta - origin) / scale`, so a unit step in any direction is roughly one
//! standard deviation of the corresponding parameter. Box bounds are applied by clamping
//! inside the cost function.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::DMatrix;

use crate::error::{CalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Method {
    /// L-BFGS with a Nelder-Mead polish when it stops early.
    #[default]
    Lbfgs,
    NelderMead,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub method: Method,
    pub max_iter: u64,
    /// Gradient tolerance for L-BFGS, cost spread tolerance for Nelder-Mead.
    pub tol: f64,
    /// Number of L-BFGS corrections.
    pub m: usize,
    /// Initial simplex edge in scale units.
    pub simplex_step: f64,
    /// Wall-clock budget in seconds.
    pub timeout: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            method: Method::Lbfgs,
            max_iter: 2000,
            tol: 1e-6,
            m: 10,
            simplex_step: 1.0,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub parameters: Vec<f64>,
    pub fval: f64,
    pub n_iter: u64,
    pub n_fev: usize,
    pub converged: bool,
    pub message: String,
}

impl std::fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.converged
        )
    }
}

pub trait ObjectiveFunction {
    fn eval(&self, params: &[f64]) -> Result<f64>;
}

impl<F> ObjectiveFunction for F
where
    F: Fn(&[f64]) -> f64,
{
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(self(params))
    }
}

struct Tracker {
    best_params: Vec<f64>,
    best_cost: f64,
    n_fev: usize,
}

#[derive(Clone, Copy)]
struct ScaledProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    origin: &'a [f64],
    scales: &'a [f64],
    bounds: &'a [(f64, f64)],
    tracker: &'a Mutex<Tracker>,
}

impl ScaledProblem<'_> {
    fn to_params(&self, u: &[f64]) -> Vec<f64> {
        u.iter()
            .zip(self.origin)
            .zip(self.scales)
            .zip(self.bounds)
            .map(|(((u, origin), scale), (lo, hi))| (origin + u * scale).clamp(*lo, *hi))
            .collect()
    }

    fn to_scaled(&self, params: &[f64]) -> Vec<f64> {
        params
            .iter()
            .zip(self.origin)
            .zip(self.scales)
            .map(|((p, origin), scale)| (p - origin) / scale)
            .collect()
    }

    fn eval_scaled(&self, u: &[f64]) -> Result<f64> {
        let params = self.to_params(u);
        let cost = self.objective.eval(&params)?;
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.n_fev += 1;
            if cost.is_finite() && cost < tracker.best_cost {
                tracker.best_cost = cost;
                tracker.best_params = params;
            }
        }
        // the line search cannot deal with NaN, treat it as a wall
        Ok(if cost.is_nan() { f64::INFINITY } else { cost })
    }

    fn best(&self) -> (Vec<f64>, f64, usize) {
        match self.tracker.lock() {
            Ok(tracker) => (tracker.best_params.clone(), tracker.best_cost, tracker.n_fev),
            Err(_) => (self.origin.to_vec(), f64::NAN, 0),
        }
    }
}

impl CostFunction for ScaledProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, u: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.eval_scaled(u)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for ScaledProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, u: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let mut grad = vec![0.0; u.len()];
        let mut shifted = u.clone();
        for i in 0..u.len() {
            let eps = 1e-6 * u[i].abs().max(1.0);
            shifted[i] = u[i] + eps;
            let f_plus = self.cost(&shifted)?;
            shifted[i] = u[i] - eps;
            let f_minus = self.cost(&shifted)?;
            shifted[i] = u[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }

        // zero components that push further into an active bound
        let params = self.to_params(u);
        for (i, (&x, &(lo, hi))) in params.iter().zip(self.bounds).enumerate() {
            if (x <= lo && grad[i] > 0.0) || (x >= hi && grad[i] < 0.0) {
                grad[i] = 0.0;
            }
        }
        Ok(grad)
    }
}

fn is_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

fn is_timeout(status: &TerminationStatus) -> bool {
    matches!(status, TerminationStatus::Terminated(TerminationReason::Timeout))
}

struct RunOutcome {
    n_iter: u64,
    converged: bool,
    timed_out: bool,
    message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Minimizer {
    pub config: OptimizerConfig,
}

impl Minimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` from `init`.
    ///
    /// `scales` must be positive and give the typical size of a change in each parameter;
    /// `bounds` may be infinite.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        scales: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init.len() != scales.len() || init.len() != bounds.len() {
            return Err(CalError::Contract(format!(
                "parameter, scale and bound lengths differ: {} / {} / {}",
                init.len(),
                scales.len(),
                bounds.len()
            )));
        }
        if init.is_empty() {
            return Err(CalError::contract("nothing to minimize: zero parameters"));
        }

        let origin: Vec<f64> = init
            .iter()
            .zip(bounds)
            .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
            .collect();
        let scales: Vec<f64> = scales
            .iter()
            .map(|s| if s.is_finite() && *s > 0.0 { *s } else { 1.0 })
            .collect();

        let start_cost = objective.eval(&origin)?;
        if !start_cost.is_finite() {
            return Err(CalError::Numerical(format!(
                "objective is {start_cost} at the start point {origin:?}"
            )));
        }

        let tracker = Mutex::new(Tracker {
            best_params: origin.clone(),
            best_cost: start_cost,
            n_fev: 1,
        });
        let problem = ScaledProblem {
            objective,
            origin: &origin,
            scales: &scales,
            bounds,
            tracker: &tracker,
        };

        let started = Instant::now();
        let budget = self.config.timeout.map(Duration::from_secs_f64);

        let outcome = match self.config.method {
            Method::NelderMead => self.run_nelder_mead(problem, &origin, budget, started)?,
            Method::Lbfgs => match self.run_lbfgs(problem, budget) {
                Ok(outcome) if outcome.converged || outcome.timed_out => outcome,
                Ok(outcome) => {
                    log::debug!("L-BFGS stopped early ({}), polishing", outcome.message);
                    let (best, _, _) = problem.best();
                    let polish = self.run_nelder_mead(problem, &best, budget, started)?;
                    RunOutcome {
                        n_iter: outcome.n_iter + polish.n_iter,
                        ..polish
                    }
                }
                Err(e) => {
                    log::debug!("L-BFGS failed ({e}), falling back to Nelder-Mead");
                    let (best, _, _) = problem.best();
                    self.run_nelder_mead(problem, &best, budget, started)?
                }
            },
        };

        let (parameters, fval, n_fev) = problem.best();
        if outcome.timed_out {
            log::warn!(
                "minimizer ran out of its {:.1} s budget, returning best point so far",
                budget.map(|b| b.as_secs_f64()).unwrap_or_default()
            );
        }

        Ok(OptimizationResult {
            parameters,
            fval,
            n_iter: outcome.n_iter,
            n_fev,
            converged: outcome.converged && !outcome.timed_out,
            message: outcome.message,
        })
    }

    fn run_lbfgs(&self, problem: ScaledProblem<'_>, budget: Option<Duration>) -> Result<RunOutcome> {
        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = if self.config.tol == 0.0 {
            0.0
        } else {
            (1e-4 * self.config.tol).max(1e-14)
        };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)?
            .with_tolerance_cost(tol_cost)?;

        let n = problem.origin.len();
        let mut executor = Executor::new(problem, solver)
            .configure(|state| state.param(vec![0.0; n]).max_iters(self.config.max_iter));
        if let Some(budget) = budget {
            executor = executor.timeout(budget);
        }
        let res = executor.run()?;
        let status = res.state().get_termination_status();

        Ok(RunOutcome {
            n_iter: res.state().get_iter(),
            converged: is_converged(status),
            timed_out: is_timeout(status),
            message: status.to_string(),
        })
    }

    fn run_nelder_mead(
        &self,
        problem: ScaledProblem<'_>,
        start: &[f64],
        budget: Option<Duration>,
        started: Instant,
    ) -> Result<RunOutcome> {
        let remaining = match budget {
            Some(budget) => match budget.checked_sub(started.elapsed()) {
                Some(remaining) if !remaining.is_zero() => Some(remaining),
                _ => {
                    return Ok(RunOutcome {
                        n_iter: 0,
                        converged: false,
                        timed_out: true,
                        message: "Timeout".to_string(),
                    });
                }
            },
            None => None,
        };

        let u0 = problem.to_scaled(start);
        let mut simplex = vec![u0.clone()];
        for i in 0..u0.len() {
            let mut vertex = u0.clone();
            vertex[i] += self.config.simplex_step;
            simplex.push(vertex);
        }
        let tol = if self.config.tol > 0.0 {
            self.config.tol * 1e-2
        } else {
            f64::EPSILON
        };
        let solver = NelderMead::new(simplex).with_sd_tolerance(tol)?;

        let mut executor = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.config.max_iter.saturating_mul(5)));
        if let Some(remaining) = remaining {
            executor = executor.timeout(remaining);
        }
        let res = executor.run()?;
        let status = res.state().get_termination_status();

        Ok(RunOutcome {
            n_iter: res.state().get_iter(),
            converged: is_converged(status),
            timed_out: is_timeout(status),
            message: status.to_string(),
        })
    }
}

/// Central finite-difference Hessian of `objective` at `params` with per-parameter steps.
pub fn hessian(objective: &dyn ObjectiveFunction, params: &[f64], steps: &[f64]) -> Result<DMatrix<f64>> {
    let n = params.len();
    if steps.len() != n {
        return Err(CalError::Contract(format!(
            "hessian needs one step per parameter, got {} for {n}",
            steps.len()
        )));
    }
    let f0 = objective.eval(params)?;
    let mut x = params.to_vec();
    let mut eval_at = |shifts: &[(usize, f64)]| -> Result<f64> {
        for &(i, d) in shifts {
            x[i] += d;
        }
        let value = objective.eval(&x);
        for &(i, d) in shifts {
            x[i] -= d;
        }
        value
    };

    let mut h = DMatrix::zeros(n, n);
    for i in 0..n {
        let hi = steps[i];
        let f_plus = eval_at(&[(i, hi)])?;
        let f_minus = eval_at(&[(i, -hi)])?;
        h[(i, i)] = (f_plus - 2.0 * f0 + f_minus) / (hi * hi);

        for j in 0..i {
            let hj = steps[j];
            let f_pp = eval_at(&[(i, hi), (j, hj)])?;
            let f_pm = eval_at(&[(i, hi), (j, -hj)])?;
            let f_mp = eval_at(&[(i, -hi), (j, hj)])?;
            let f_mm = eval_at(&[(i, -hi), (j, -hj)])?;
            let value = (f_pp - f_pm - f_mp + f_mm) / (4.0 * hi * hj);
            h[(i, j)] = value;
            h[(j, i)] = value;
        }
    }

    if h.iter().any(|v| !v.is_finite()) {
        return Err(CalError::Numerical(
            "hessian has non-finite entries".to_string(),
        ));
    }
    Ok(h)
}

/// `2 * errordef * H^-1`, using a pseudo-inverse when the Hessian is singular.
pub fn covariance_from_hessian(hessian: &DMatrix<f64>, errordef: f64) -> Result<DMatrix<f64>> {
    let inverse = match hessian.clone().lu().try_inverse() {
        Some(inverse) => inverse,
        None => {
            log::warn!("hessian is singular, using its pseudo-inverse for the covariance");
            hessian
                .clone()
                .pseudo_inverse(1e-12)
                .map_err(|e| CalError::Numerical(format!("cannot invert hessian: {e}")))?
        }
    };
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(CalError::Numerical(
            "covariance has non-finite entries".to_string(),
        ));
    }
    Ok(inverse * (2.0 * errordef))
}

/// Square roots of the absolute covariance diagonal.
pub fn uncertainties(covariance: &DMatrix<f64>) -> Vec<f64> {
    covariance.diagonal().iter().map(|v| v.abs().sqrt()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quadratic(p: &[f64]) -> f64 {
        (p[0] - 2.0).powi(2) + 4.0 * (p[1] + 3.0).powi(2)
    }

    fn rosenbrock(p: &[f64]) -> f64 {
        (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0] * p[0]).powi(2)
    }

    #[test]
    fn lbfgs_finds_quadratic_minimum() {
        let res = Minimizer::default()
            .minimize(&quadratic, &[0.0, 0.0], &[1.0, 1.0], &[(f64::NEG_INFINITY, f64::INFINITY); 2])
            .unwrap();
        assert!(res.converged, "{res}");
        assert_relative_eq!(res.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(res.parameters[1], -3.0, epsilon = 1e-4);
    }

    #[test]
    fn bounds_are_respected() {
        let res = Minimizer::default()
            .minimize(&quadratic, &[4.0, 0.0], &[1.0, 1.0], &[(3.0, 5.0), (-1.0, 1.0)])
            .unwrap();
        assert_relative_eq!(res.parameters[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(res.parameters[1], -1.0, epsilon = 1e-4);
    }

    #[test]
    fn nelder_mead_solves_rosenbrock() {
        let config = OptimizerConfig {
            method: Method::NelderMead,
            tol: 1e-10,
            simplex_step: 0.5,
            ..OptimizerConfig::default()
        };
        let res = Minimizer::new(config)
            .minimize(&rosenbrock, &[-1.0, 1.0], &[1.0, 1.0], &[(-5.0, 5.0); 2])
            .unwrap();
        assert_relative_eq!(res.parameters[0], 1.0, epsilon = 1e-2);
        assert_relative_eq!(res.parameters[1], 1.0, epsilon = 2e-2);
    }

    #[test]
    fn non_finite_start_is_numerical_error() {
        let f = |_: &[f64]| f64::NAN;
        let err = Minimizer::default()
            .minimize(&f, &[1.0], &[1.0], &[(f64::NEG_INFINITY, f64::INFINITY)])
            .unwrap_err();
        assert!(matches!(err, CalError::Numerical(_)));
    }

    #[test]
    fn hessian_and_covariance_of_a_chi2_bowl() {
        // chi2 = ((a - 1) / 0.5)^2 + ((b - 2) / 2)^2
        let chi2 = |p: &[f64]| ((p[0] - 1.0) / 0.5).powi(2) + ((p[1] - 2.0) / 2.0).powi(2);
        let h = hessian(&chi2, &[1.0, 2.0], &[1e-3, 1e-3]).unwrap();
        assert_relative_eq!(h[(0, 0)], 8.0, epsilon = 1e-4);
        assert_relative_eq!(h[(1, 1)], 0.5, epsilon = 1e-4);
        assert_relative_eq!(h[(0, 1)], 0.0, epsilon = 1e-4);

        let cov = covariance_from_hessian(&h, 1.0).unwrap();
        let errors = uncertainties(&cov);
        assert_relative_eq!(errors[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(errors[1], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn singular_hessian_falls_back_to_pseudo_inverse() {
        let h = DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 2.0, 2.0]);
        let cov = covariance_from_hessian(&h, 0.5).unwrap();
        assert!(cov.iter().all(|v| v.is_finite()));
    }
}
