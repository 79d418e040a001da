//! Chi-square fits of `y = f(x; theta)` with uncertainties on both axes.
//!
//! The x uncertainty enters through the model slope: each point is weighted by
//! `sigma_y^2 + (df/dx * sigma_x)^2`, with `df/dx` taken from a dual-number evaluation of
//! the model. Gaussian pull terms can constrain any subset of the parameters.

use compute::predict::PolynomialRegressor;

use super::common::{FitResult, GoodnessOfFit, chi2_p_value};
use super::optimizer::{self, Minimizer, OptimizerConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result, ensure_same_len};
use crate::util::dual::Dual;
use crate::util::measurement::Measurement;

/// Gaussian prior on one parameter.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Pull {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chi2Options {
    pub guess: Option<Vec<f64>>,
    /// Empty, or one entry per parameter.
    pub pulls: Vec<Option<Pull>>,
    pub compute_uncertainty: bool,
    pub optimizer: OptimizerConfig,
}

impl Default for Chi2Options {
    fn default() -> Self {
        Self {
            guess: None,
            pulls: Vec::new(),
            compute_uncertainty: true,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl Chi2Options {
    pub fn with_guess(mut self, guess: Vec<f64>) -> Self {
        self.guess = Some(guess);
        self
    }

    pub fn with_pulls(mut self, pulls: Vec<Option<Pull>>) -> Self {
        self.pulls = pulls;
        self
    }
}

struct Chi2Problem<'a, F> {
    model: &'a F,
    x: &'a [Measurement],
    y: &'a [Measurement],
    unit_weights: bool,
    pulls: &'a [Option<Pull>],
}

impl<F> Chi2Problem<'_, F>
where
    F: Fn(Dual, &[f64]) -> Dual,
{
    /// Prediction and total variance of point `i`.
    fn point(&self, i: usize, params: &[f64]) -> (f64, f64) {
        let pred = (self.model)(Dual::var(self.x[i].value), params);
        if self.unit_weights {
            return (pred.val, 1.0);
        }
        let sigma_pred = pred.dot * self.x[i].uncertainty;
        let variance = self.y[i].variance() + sigma_pred * sigma_pred;
        (pred.val, if variance > 0.0 { variance } else { 1.0 })
    }

    fn data_chi2(&self, params: &[f64]) -> f64 {
        (0..self.x.len())
            .map(|i| {
                let (pred, variance) = self.point(i, params);
                (self.y[i].value - pred).powi(2) / variance
            })
            .sum()
    }

    fn pull_chi2(&self, params: &[f64]) -> f64 {
        self.pulls
            .iter()
            .zip(params)
            .filter_map(|(pull, value)| pull.map(|p| ((value - p.mean) / p.std).powi(2)))
            .sum()
    }

    fn chi2(&self, params: &[f64]) -> f64 {
        self.data_chi2(params) + self.pull_chi2(params)
    }

    /// Inverse column norms of the weighted residual Jacobian at `params`.
    fn scales(&self, params: &[f64]) -> Vec<f64> {
        let base: Vec<(f64, f64)> = (0..self.x.len()).map(|i| self.point(i, params)).collect();
        let mut shifted = params.to_vec();
        (0..params.len())
            .map(|j| {
                let h = 1e-6 * params[j].abs().max(1e-3);
                shifted[j] = params[j] + h;
                let norm_sq: f64 = base
                    .iter()
                    .enumerate()
                    .map(|(i, (pred, variance))| {
                        let (moved, _) = self.point(i, &shifted);
                        ((moved - pred) / h).powi(2) / variance
                    })
                    .sum::<f64>()
                    + self.pulls.get(j).copied().flatten().map_or(0.0, |p| p.std.powi(-2));
                shifted[j] = params[j];
                if norm_sq.is_finite() && norm_sq > 0.0 {
                    norm_sq.sqrt().recip()
                } else {
                    params[j].abs().max(1.0)
                }
            })
            .collect()
    }
}

fn default_guess(n_params: usize, x: &[Measurement], y: &[Measurement]) -> Vec<f64> {
    match (x.first(), y.first()) {
        (Some(x0), Some(y0)) if n_params == 2 && x0.value != 0.0 => vec![y0.value / x0.value, 1.0],
        _ => vec![1.0; n_params],
    }
}

/// Minimize the chi-square of `model` against `(x, y)`.
///
/// `model` receives `x` as a dual number so its slope can be propagated; parameters are
/// plain values.
pub fn chi2fit<F>(
    n_params: usize,
    model: F,
    x: &[Measurement],
    y: &[Measurement],
    options: &Chi2Options,
) -> Result<FitResult>
where
    F: Fn(Dual, &[f64]) -> Dual,
{
    ensure_same_len("chi2fit x/y", x.len(), y.len())?;
    if n_params == 0 {
        return Err(CalError::contract("chi2fit needs at least one parameter"));
    }
    if !options.pulls.is_empty() {
        ensure_same_len("chi2fit pulls/parameters", options.pulls.len(), n_params)?;
    }
    if options.pulls.iter().flatten().any(|p| !(p.std > 0.0)) {
        return Err(CalError::contract("pull widths must be positive"));
    }
    if x.is_empty() {
        return Err(CalError::InsufficientData("chi2fit has no data points".to_string()));
    }

    let guess = match &options.guess {
        Some(guess) => {
            ensure_same_len("chi2fit guess/parameters", guess.len(), n_params)?;
            guess.clone()
        }
        None => default_guess(n_params, x, y),
    };

    let unit_weights = x
        .iter()
        .zip(y)
        .all(|(xi, yi)| xi.uncertainty == 0.0 && yi.uncertainty == 0.0);
    let problem = Chi2Problem {
        model: &model,
        x,
        y,
        unit_weights,
        pulls: &options.pulls,
    };

    let mut diagnostics = Diagnostics::new();
    if unit_weights {
        diagnostics.info("chi2fit", "no uncertainties given, using unit weights");
    }

    let objective = |p: &[f64]| problem.chi2(p);
    let scales = problem.scales(&guess);
    let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); n_params];
    let minimum = Minimizer::new(options.optimizer.clone()).minimize(&objective, &guess, &scales, &bounds)?;
    if !minimum.converged {
        diagnostics.warn(
            "chi2fit",
            format!("minimizer did not converge: {}", minimum.message),
        );
    }
    let best = minimum.parameters;

    let names: Vec<String> = (0..n_params).map(|i| format!("p{i}")).collect();
    if !options.compute_uncertainty {
        return Ok(FitResult {
            names,
            parameters: best.iter().map(|v| Measurement::exact(*v)).collect(),
            covariance: None,
            goodness: None,
            fval: minimum.fval,
            converged: minimum.converged,
            diagnostics,
        });
    }

    let steps: Vec<f64> = problem.scales(&best).iter().map(|s| 1e-3 * s).collect();
    let covariance = optimizer::hessian(&objective, &best, &steps)
        .and_then(|h| optimizer::covariance_from_hessian(&h, 1.0));
    let (parameters, covariance) = match covariance {
        Ok(cov) => {
            let errors = optimizer::uncertainties(&cov);
            let parameters = best
                .iter()
                .zip(errors)
                .map(|(v, e)| Measurement::new(*v, e))
                .collect();
            (parameters, Some(cov))
        }
        Err(e) => {
            diagnostics.warn("chi2fit", format!("no covariance: {e}"));
            let parameters = best
                .iter()
                .map(|v| Measurement::new(*v, f64::NAN))
                .collect();
            (parameters, None)
        }
    };

    let y_has_errors = y.iter().any(|yi| yi.uncertainty > 0.0);
    let residuals = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| {
            let pred = model(Dual::constant(xi.value), &best).val;
            if y_has_errors && yi.uncertainty > 0.0 {
                (yi.value - pred) / yi.uncertainty
            } else {
                yi.value - pred
            }
        })
        .collect();
    let dof = x.len() as i64 - n_params as i64;
    if dof <= 0 {
        diagnostics.warn(
            "chi2fit",
            format!("{} points for {n_params} parameters, p-value undefined", x.len()),
        );
    }
    let chi2 = minimum.fval;
    let goodness = GoodnessOfFit {
        p_value: chi2_p_value(chi2, dof),
        chi2,
        dof,
        residuals,
    };

    log::debug!(
        "chi2fit: {:?}, chi2 {chi2:.3} / {dof}, p = {:.4}",
        best,
        goodness.p_value
    );

    Ok(FitResult {
        names,
        parameters,
        covariance,
        goodness: Some(goodness),
        fval: chi2,
        converged: minimum.converged,
        diagnostics,
    })
}

/// Pairs raw arrays into measurements; missing uncertainty arrays mean exact values.
pub fn measurements(values: &[f64], uncertainties: Option<&[f64]>) -> Result<Vec<Measurement>> {
    match uncertainties {
        Some(errors) => {
            ensure_same_len("values/uncertainties", values.len(), errors.len())?;
            Ok(values
                .iter()
                .zip(errors)
                .map(|(v, e)| Measurement::new(*v, *e))
                .collect())
        }
        None => Ok(values.iter().map(|v| Measurement::exact(*v)).collect()),
    }
}

pub fn chi2fit_raw<F>(
    n_params: usize,
    model: F,
    x: &[f64],
    x_err: Option<&[f64]>,
    y: &[f64],
    y_err: Option<&[f64]>,
    options: &Chi2Options,
) -> Result<FitResult>
where
    F: Fn(Dual, &[f64]) -> Dual,
{
    let x = measurements(x, x_err)?;
    let y = measurements(y, y_err)?;
    chi2fit(n_params, model, &x, &y, options)
}

/// `sum_k coefficients[k] * x^k`
pub fn polynomial(x: Dual, coefficients: &[f64]) -> Dual {
    coefficients
        .iter()
        .rev()
        .fold(Dual::constant(0.0), |acc, c| acc * x + *c)
}

fn polynomial_names(degree: usize) -> Vec<String> {
    (0..=degree).map(|k| format!("a{k}")).collect()
}

// checked before the start point is built from the data
fn check_polynomial_inputs(
    degree: usize,
    x: &[Measurement],
    y: &[Measurement],
    options: &Chi2Options,
) -> Result<()> {
    ensure_same_len("polynomial fit x/y", x.len(), y.len())?;
    if !options.pulls.is_empty() && options.pulls.len() != degree + 1 {
        return Err(CalError::Contract(format!(
            "degree {degree} polynomial needs {} pull entries, got {}",
            degree + 1,
            options.pulls.len()
        )));
    }
    if x.is_empty() {
        return Err(CalError::InsufficientData(
            "polynomial fit has no data points".to_string(),
        ));
    }
    Ok(())
}

/// Unweighted least-squares polynomial through the points, ascending coefficients.
pub fn polynomial_guess(degree: usize, x: &[f64], y: &[f64]) -> Option<Vec<f64>> {
    if x.len() < degree + 1 {
        return None;
    }
    // regress on x / x_max to keep the normal equations well conditioned
    let x_max = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if !(x_max > 0.0) {
        return None;
    }
    let t: Vec<f64> = x.iter().map(|v| v / x_max).collect();
    let mut regressor = PolynomialRegressor::new(degree);
    regressor.fit(&t, y);
    let coefficients: Vec<f64> = regressor
        .coef
        .iter()
        .enumerate()
        .map(|(k, c)| c / x_max.powi(k as i32))
        .collect();
    (coefficients.len() == degree + 1 && coefficients.iter().all(|c| c.is_finite()))
        .then_some(coefficients)
}

/// Chi-square fit of a degree-`degree` polynomial, coefficients named `a0..`.
pub fn chi2fit_poly(
    degree: usize,
    x: &[Measurement],
    y: &[Measurement],
    options: &Chi2Options,
) -> Result<FitResult> {
    check_polynomial_inputs(degree, x, y, options)?;
    let mut options = options.clone();
    if options.guess.is_none() {
        let xs: Vec<f64> = x.iter().map(|m| m.value).collect();
        let ys: Vec<f64> = y.iter().map(|m| m.value).collect();
        options.guess = Some(
            polynomial_guess(degree, &xs, &ys).unwrap_or_else(|| default_guess(degree + 1, x, y)),
        );
    }
    let mut result = chi2fit(degree + 1, polynomial, x, y, &options)?;
    result.names = polynomial_names(degree);
    Ok(result)
}

pub fn chi2fit_poly_raw(
    degree: usize,
    x: &[f64],
    x_err: Option<&[f64]>,
    y: &[f64],
    y_err: Option<&[f64]>,
    options: &Chi2Options,
) -> Result<FitResult> {
    let x = measurements(x, x_err)?;
    let y = measurements(y, y_err)?;
    chi2fit_poly(degree, &x, &y, options)
}

/// Chi-square fit of `outer(p(x))` with `p` a degree-`degree` polynomial.
pub fn chi2fit_composed<G>(
    degree: usize,
    outer: G,
    x: &[Measurement],
    y: &[Measurement],
    options: &Chi2Options,
) -> Result<FitResult>
where
    G: Fn(Dual) -> Dual,
{
    check_polynomial_inputs(degree, x, y, options)?;
    let model = |xv: Dual, p: &[f64]| outer(polynomial(xv, p));
    let mut result = chi2fit(degree + 1, model, x, y, options)?;
    result.names = polynomial_names(degree);
    Ok(result)
}

pub fn chi2fit_composed_raw<G>(
    degree: usize,
    outer: G,
    x: &[f64],
    x_err: Option<&[f64]>,
    y: &[f64],
    y_err: Option<&[f64]>,
    options: &Chi2Options,
) -> Result<FitResult>
where
    G: Fn(Dual) -> Dual,
{
    let x = measurements(x, x_err)?;
    let y = measurements(y, y_err)?;
    chi2fit_composed(degree, outer, &x, &y, options)
}
