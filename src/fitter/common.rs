use nalgebra::DMatrix;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::diagnostics::Diagnostics;
use crate::util::measurement::Measurement;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GoodnessOfFit {
    pub p_value: f64,
    pub chi2: f64,
    pub dof: i64,
    /// Normalized residual per data point or bin.
    pub residuals: Vec<f64>,
}

/// Upper-tail probability of a chi-square distribution, NaN without degrees of freedom.
pub fn chi2_p_value(chi2: f64, dof: i64) -> f64 {
    if dof <= 0 || !chi2.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(dof as f64) {
        Ok(dist) => dist.sf(chi2.max(0.0)),
        Err(_) => f64::NAN,
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FitResult {
    pub names: Vec<String>,
    pub parameters: Vec<Measurement>,
    pub covariance: Option<DMatrix<f64>>,
    pub goodness: Option<GoodnessOfFit>,
    /// Objective at the optimum.
    pub fval: f64,
    pub converged: bool,
    pub diagnostics: Diagnostics,
}

impl FitResult {
    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn get(&self, name: &str) -> Option<Measurement> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.parameters[i])
    }

    pub fn p_value(&self) -> Option<f64> {
        self.goodness.as_ref().map(|g| g.p_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn chi2_survival_function() {
        assert_relative_eq!(chi2_p_value(0.0, 3), 1.0);
        // median of chi2(1) is 0.4549
        assert_relative_eq!(chi2_p_value(0.454_936_4, 1), 0.5, epsilon = 1e-6);
        assert!(chi2_p_value(1.0, 0).is_nan());
    }
}
