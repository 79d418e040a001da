use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::error::{CalError, Result};
use crate::fitter::chi2::polynomial;
use crate::util::dual::Dual;
use crate::util::measurement::Measurement;

const INVERT_MAX_ITER: usize = 100;

/// Raw value to calibrated value.
///
/// Coefficients are ascending (`c0 + c1*x + ...`). For `Composed` the flattened coefficient
/// vector is the outer function's coefficients followed by the inner one's, which is also
/// the order a covariance matrix passed to [`CalibrationFunction::propagate`] must use.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationFunction {
    Polynomial {
        coefficients: Vec<f64>,
    },
    /// Polynomial in `x / scale`.
    PolynomialOfRatio {
        coefficients: Vec<f64>,
        scale: f64,
    },
    /// `outer(inner(x))`
    Composed {
        outer: Box<CalibrationFunction>,
        inner: Box<CalibrationFunction>,
    },
}

impl Default for CalibrationFunction {
    fn default() -> Self {
        CalibrationFunction::Polynomial {
            coefficients: vec![0.0, 1.0],
        }
    }
}

impl CalibrationFunction {
    pub fn linear(offset: f64, slope: f64) -> Self {
        CalibrationFunction::Polynomial {
            coefficients: vec![offset, slope],
        }
    }

    pub fn polynomial(coefficients: Vec<f64>) -> Self {
        CalibrationFunction::Polynomial { coefficients }
    }

    pub fn polynomial_of_ratio(coefficients: Vec<f64>, scale: f64) -> Result<Self> {
        if !(scale.is_finite() && scale != 0.0) {
            return Err(CalError::Contract(format!(
                "polynomial-of-ratio scale must be finite and nonzero, got {scale}"
            )));
        }
        Ok(CalibrationFunction::PolynomialOfRatio {
            coefficients,
            scale,
        })
    }

    /// Applies `outer` to the output of `self`.
    pub fn then(self, outer: CalibrationFunction) -> Self {
        CalibrationFunction::Composed {
            outer: Box::new(outer),
            inner: Box::new(self),
        }
    }

    pub fn coefficients(&self) -> Vec<f64> {
        match self {
            CalibrationFunction::Polynomial { coefficients }
            | CalibrationFunction::PolynomialOfRatio { coefficients, .. } => coefficients.clone(),
            CalibrationFunction::Composed { outer, inner } => {
                let mut all = outer.coefficients();
                all.extend(inner.coefficients());
                all
            }
        }
    }

    pub fn n_coefficients(&self) -> usize {
        match self {
            CalibrationFunction::Polynomial { coefficients }
            | CalibrationFunction::PolynomialOfRatio { coefficients, .. } => coefficients.len(),
            CalibrationFunction::Composed { outer, inner } => {
                outer.n_coefficients() + inner.n_coefficients()
            }
        }
    }

    pub fn eval_dual(&self, x: Dual) -> Dual {
        match self {
            CalibrationFunction::Polynomial { coefficients } => polynomial(x, coefficients),
            CalibrationFunction::PolynomialOfRatio {
                coefficients,
                scale,
            } => polynomial(x / *scale, coefficients),
            CalibrationFunction::Composed { outer, inner } => outer.eval_dual(inner.eval_dual(x)),
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.eval_dual(Dual::constant(x)).val
    }

    pub fn derivative(&self, x: f64) -> f64 {
        self.eval_dual(Dual::var(x)).dot
    }

    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|x| self.eval(*x)).collect()
    }

    /// Partial derivatives with respect to each flattened coefficient at `x`.
    pub fn coefficient_gradient(&self, x: f64) -> Vec<f64> {
        match self {
            CalibrationFunction::Polynomial { coefficients } => powers(x, coefficients.len()),
            CalibrationFunction::PolynomialOfRatio {
                coefficients,
                scale,
            } => powers(x / scale, coefficients.len()),
            CalibrationFunction::Composed { outer, inner } => {
                let u = inner.eval(x);
                let slope = outer.derivative(u);
                let mut gradient = outer.coefficient_gradient(u);
                gradient.extend(inner.coefficient_gradient(x).iter().map(|g| slope * g));
                gradient
            }
        }
    }

    /// Calibrated value with `J Cov J^T + (f'(x) sigma_x)^2` as variance.
    ///
    /// Without a covariance only the uncertainty of `x` is propagated.
    pub fn propagate(&self, x: Measurement, covariance: Option<&DMatrix<f64>>) -> Result<Measurement> {
        let out = self.eval_dual(Dual::var(x.value));
        let mut variance = (out.dot * x.uncertainty).powi(2);
        if let Some(cov) = covariance {
            let n = self.n_coefficients();
            if cov.nrows() != n || cov.ncols() != n {
                return Err(CalError::Contract(format!(
                    "covariance is {}x{}, calibration has {n} coefficients",
                    cov.nrows(),
                    cov.ncols()
                )));
            }
            let jacobian = DVector::from_vec(self.coefficient_gradient(x.value));
            variance += jacobian.dot(&(cov * &jacobian));
        }
        Ok(Measurement::new(out.val, variance.abs().sqrt()))
    }

    /// Converts a width measured at raw position `at` into calibrated units.
    pub fn calibrate_width(&self, width: Measurement, at: f64) -> Measurement {
        width * self.derivative(at).abs()
    }

    /// Raw value mapping to `y`, searched inside `bracket`.
    ///
    /// Newton steps are taken while they stay inside the current bracket, otherwise the
    /// bracket is bisected. `None` when `f - y` does not change sign over the bracket.
    pub fn invert(&self, y: f64, bracket: (f64, f64)) -> Option<f64> {
        let (mut lo, mut hi) = if bracket.0 <= bracket.1 {
            bracket
        } else {
            (bracket.1, bracket.0)
        };
        let g_lo = self.eval(lo) - y;
        let g_hi = self.eval(hi) - y;
        if !(g_lo.is_finite() && g_hi.is_finite()) || g_lo * g_hi > 0.0 {
            return None;
        }
        if g_lo == 0.0 {
            return Some(lo);
        }
        if g_hi == 0.0 {
            return Some(hi);
        }
        let lo_negative = g_lo < 0.0;
        let tolerance = 1e-12 * y.abs().max(1.0);

        let mut x = lo - g_lo * (hi - lo) / (g_hi - g_lo);
        for _ in 0..INVERT_MAX_ITER {
            let value = self.eval_dual(Dual::var(x));
            let g = value.val - y;
            if g.abs() <= tolerance {
                return Some(x);
            }
            if (g < 0.0) == lo_negative {
                lo = x;
            } else {
                hi = x;
            }
            let newton = x - g / value.dot;
            x = if value.dot != 0.0 && newton > lo && newton < hi {
                newton
            } else {
                0.5 * (lo + hi)
            };
            if hi - lo <= 1e-15 * x.abs().max(1.0) {
                return Some(x);
            }
        }
        Some(x)
    }

    /// The formula as text with `var` as the free variable.
    pub fn formula(&self, var: &str) -> String {
        match self {
            CalibrationFunction::Polynomial { coefficients } => polynomial_text(coefficients, var),
            CalibrationFunction::PolynomialOfRatio {
                coefficients,
                scale,
            } => polynomial_text(coefficients, &format!("({var}/{scale})")),
            CalibrationFunction::Composed { outer, inner } => {
                outer.formula(&format!("({})", inner.formula(var)))
            }
        }
    }
}

impl fmt::Display for CalibrationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formula("x"))
    }
}

fn powers(x: f64, n: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(n);
    let mut p = 1.0;
    for _ in 0..n {
        out.push(p);
        p *= x;
    }
    out
}

fn polynomial_text(coefficients: &[f64], var: &str) -> String {
    let mut text = String::new();
    for (k, c) in coefficients.iter().enumerate() {
        if *c == 0.0 {
            continue;
        }
        let magnitude = if text.is_empty() {
            *c
        } else {
            text.push_str(if *c < 0.0 { " - " } else { " + " });
            c.abs()
        };
        match k {
            0 => text.push_str(&format!("{magnitude}")),
            1 => text.push_str(&format!("{magnitude}*{var}")),
            _ => text.push_str(&format!("{magnitude}*{var}^{k}")),
        }
    }
    if text.is_empty() {
        text.push('0');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quadratic() -> CalibrationFunction {
        CalibrationFunction::polynomial(vec![1.5, 0.4, 2e-6])
    }

    #[test]
    fn evaluates_value_and_slope() {
        let f = quadratic();
        assert_relative_eq!(f.eval(1000.0), 1.5 + 400.0 + 2.0, max_relative = 1e-12);
        assert_relative_eq!(f.derivative(1000.0), 0.4 + 4e-3, max_relative = 1e-12);
    }

    #[test]
    fn ratio_form_matches_plain_polynomial() {
        let scale = 5000.0;
        let ratio =
            CalibrationFunction::polynomial_of_ratio(vec![1.5, 0.4 * scale, 2e-6 * scale * scale], scale)
                .unwrap();
        for x in [0.0, 123.0, 4321.0] {
            assert_relative_eq!(ratio.eval(x), quadratic().eval(x), max_relative = 1e-12);
            assert_relative_eq!(ratio.derivative(x), quadratic().derivative(x), max_relative = 1e-12);
        }
        assert!(CalibrationFunction::polynomial_of_ratio(vec![1.0], 0.0).is_err());
    }

    #[test]
    fn composed_chains_inner_then_outer() {
        let f = CalibrationFunction::linear(0.0, 0.5).then(CalibrationFunction::polynomial(vec![1.0, 1.0, 0.01]));
        // outer(0.5 * 10) = 1 + 5 + 0.25
        assert_relative_eq!(f.eval(10.0), 6.25, max_relative = 1e-12);
        // (1 + 0.02 * 5) * 0.5
        assert_relative_eq!(f.derivative(10.0), 0.55, max_relative = 1e-12);
        assert_eq!(f.coefficients(), vec![1.0, 1.0, 0.01, 0.0, 0.5]);

        let gradient = f.coefficient_gradient(10.0);
        assert_relative_eq!(gradient[2], 25.0, max_relative = 1e-12);
        // d/d(inner slope) = outer'(5) * 10
        assert_relative_eq!(gradient[4], 1.1 * 10.0, max_relative = 1e-12);
    }

    #[test]
    fn inverts_quadratic_inside_bracket() {
        let f = quadratic();
        let x = f.invert(1500.0, (0.0, 10_000.0)).unwrap();
        assert_relative_eq!(f.eval(x), 1500.0, max_relative = 1e-10);
        assert!(f.invert(1e9, (0.0, 10_000.0)).is_none());

        let flat = CalibrationFunction::polynomial(vec![2.0]);
        assert!(flat.invert(1.0, (0.0, 1.0)).is_none());
    }

    #[test]
    fn propagation_adds_parameter_and_input_variance() {
        let f = CalibrationFunction::polynomial(vec![1.0, 2.0, 0.0]);
        let cov = DMatrix::from_row_slice(3, 3, &[0.04, 0.01, 0.0, 0.01, 0.09, 0.0, 0.0, 0.0, 0.0]);
        let x = Measurement::new(3.0, 0.5);
        let out = f.propagate(x, Some(&cov)).unwrap();
        // J = [1, 3, 9]: 0.04 + 2*3*0.01 + 9*0.09 = 0.91, plus (2 * 0.5)^2
        assert_relative_eq!(out.value, 7.0, max_relative = 1e-12);
        assert_relative_eq!(out.uncertainty, (0.91_f64 + 1.0).sqrt(), max_relative = 1e-12);

        let input_only = f.propagate(x, None).unwrap();
        assert_relative_eq!(input_only.uncertainty, 1.0, max_relative = 1e-12);

        let wrong = DMatrix::<f64>::zeros(2, 2);
        assert!(f.propagate(x, Some(&wrong)).unwrap_err().is_contract());
    }

    #[test]
    fn width_scales_with_local_slope() {
        let f = quadratic();
        let width = f.calibrate_width(Measurement::new(5.0, 0.1), 1000.0);
        assert_relative_eq!(width.value, 5.0 * 0.404, max_relative = 1e-12);
        assert_relative_eq!(width.uncertainty, 0.1 * 0.404, max_relative = 1e-12);
    }

    #[test]
    fn formula_text() {
        assert_eq!(
            CalibrationFunction::polynomial(vec![1.5, -0.25, 0.0, 3.0]).to_string(),
            "1.5 - 0.25*x + 3*x^3"
        );
        assert_eq!(
            CalibrationFunction::polynomial_of_ratio(vec![0.0, 2.0], 4.0)
                .unwrap()
                .to_string(),
            "2*(x/4)"
        );
        let composed = CalibrationFunction::linear(1.0, 2.0).then(CalibrationFunction::linear(0.0, 3.0));
        assert_eq!(composed.formula("adc"), "3*(1 + 2*adc)");
        assert_eq!(CalibrationFunction::polynomial(vec![0.0]).to_string(), "0");
    }

    #[test]
    fn serializes_as_tagged_union() {
        let f = CalibrationFunction::polynomial_of_ratio(vec![0.5, 2.0], 1000.0)
            .unwrap()
            .then(CalibrationFunction::polynomial(vec![0.0, 1.0, 1e-7]));
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("composed"));
        let back: CalibrationFunction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);

        let text = ron::to_string(&f).unwrap();
        let back: CalibrationFunction = ron::from_str(&text).unwrap();
        assert_eq!(back, f);
    }
}
