//! Goodness of fit for binned peak fits.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use rayon::prelude::*;

use super::binned::{deviance_terms, expected_counts, fit_peak_from};
use super::common::{GoodnessOfFit, chi2_p_value};
use crate::config::PeakFitConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result};
use crate::histoer::histogram1d::Histogram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodnessMethod {
    None,
    #[default]
    LeastSquares,
    LogLikelihoodRatio,
    MonteCarlo,
}

/// Expected counts per bin from a density (counts per x unit) evaluated at bin centers.
pub fn model_counts(model: impl Fn(f64) -> f64, hist: &Histogram) -> Vec<f64> {
    hist.centers()
        .iter()
        .zip(hist.widths())
        .map(|(x, w)| model(*x) * w)
        .collect()
}

/// Pearson chi-square over the bins with a positive prediction.
pub fn least_squares(
    expected: &[f64],
    observed: &[f64],
    n_free: usize,
    diagnostics: &mut Diagnostics,
) -> GoodnessOfFit {
    let mut chi2 = 0.0;
    let mut n_bins = 0i64;
    let mut low_bins = 0usize;
    let residuals = expected
        .iter()
        .zip(observed)
        .map(|(nu, n)| {
            if *nu > 0.0 {
                n_bins += 1;
                if *nu <= 5.0 {
                    low_bins += 1;
                }
                chi2 += (nu - n).powi(2) / nu;
                (n - nu) / nu.sqrt()
            } else {
                0.0
            }
        })
        .collect();
    if low_bins > 0 {
        diagnostics.warn(
            "goodness",
            format!("{low_bins} bins predict 5 counts or fewer, chi2 p-value is approximate"),
        );
    }
    let dof = n_bins - n_free as i64;
    GoodnessOfFit {
        p_value: chi2_p_value(chi2, dof),
        chi2,
        dof,
        residuals,
    }
}

/// Poisson likelihood-ratio statistic `2 * sum(nu - n + n ln(n / nu))`.
///
/// This is the deviance with the data in the logarithm. The form with the roles of `nu`
/// and `n` swapped inside the logarithm, `2 * sum(nu ln(nu / n) + nu - n)`, is not used:
/// it is not bounded below and goes negative for e.g. `nu = [10, 40]`, `n = [5, 50]`.
pub fn log_likelihood_ratio(expected: &[f64], observed: &[f64], n_free: usize) -> GoodnessOfFit {
    let terms = deviance_terms(expected, observed);
    let n_bins = expected.iter().filter(|nu| **nu > 0.0).count() as i64;
    let chi2 = 2.0 * terms.iter().sum::<f64>();
    let residuals = terms
        .iter()
        .zip(expected.iter().zip(observed))
        .map(|(t, (nu, n))| (n - nu).signum() * (2.0 * t.max(0.0)).sqrt())
        .collect();
    let dof = n_bins - n_free as i64;
    GoodnessOfFit {
        p_value: chi2_p_value(chi2, dof),
        chi2,
        dof,
        residuals,
    }
}

/// Empirical p-value from Poisson resamples of the best-fit model, each one refitted.
///
/// Sample `i` draws from `StdRng::seed_from_u64(seed + i)`, so the result does not depend
/// on how rayon schedules the refits.
pub fn monte_carlo(
    hist: &Histogram,
    best: &[f64],
    config: &PeakFitConfig,
    n_samples: usize,
    seed: u64,
    diagnostics: &mut Diagnostics,
) -> Result<GoodnessOfFit> {
    if n_samples == 0 {
        return Err(CalError::contract("monte carlo p-value needs at least one sample"));
    }
    let shape = config.shape;
    let expected = expected_counts(shape, best, hist);
    let observed = log_likelihood_ratio(&expected, &hist.counts, shape.n_params());

    let refit_config = PeakFitConfig {
        compute_uncertainty: false,
        goodness: GoodnessMethod::None,
        ..config.clone()
    };

    let statistics: Vec<Option<f64>> = (0..n_samples)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let counts: Vec<f64> = expected
                .iter()
                .map(|nu| match Poisson::new(*nu) {
                    Ok(poisson) if *nu > 0.0 => poisson.sample(&mut rng),
                    _ => 0.0,
                })
                .collect();
            let sample = Histogram::new(hist.edges.clone(), counts).ok()?;
            if sample.total() <= 0.0 {
                return None;
            }
            let refit = fit_peak_from(&sample, best, &refit_config).ok()?;
            Some(2.0 * refit.result.fval)
        })
        .collect();

    let valid: Vec<f64> = statistics.into_iter().flatten().collect();
    if valid.len() < n_samples {
        diagnostics.warn(
            "goodness",
            format!("{} of {n_samples} monte carlo refits failed", n_samples - valid.len()),
        );
    }
    if valid.is_empty() {
        return Err(CalError::Numerical(
            "every monte carlo refit failed".to_string(),
        ));
    }
    let extreme = valid.iter().filter(|d| **d >= observed.chi2).count();

    Ok(GoodnessOfFit {
        p_value: extreme as f64 / valid.len() as f64,
        ..observed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn least_squares_skips_empty_predictions_and_warns() {
        let expected = [0.0, 4.0, 100.0];
        let observed = [1.0, 6.0, 90.0];
        let mut diagnostics = Diagnostics::new();
        let gof = least_squares(&expected, &observed, 1, &mut diagnostics);
        assert_relative_eq!(gof.chi2, 1.0 + 1.0);
        assert_eq!(gof.dof, 1);
        assert_eq!(gof.residuals[0], 0.0);
        assert!(diagnostics.has_warnings());
    }

    #[test]
    fn llr_of_perfect_model_is_zero() {
        let expected = [10.0, 20.0, 30.0];
        let gof = log_likelihood_ratio(&expected, &expected, 1);
        assert_relative_eq!(gof.chi2, 0.0);
        assert_relative_eq!(gof.p_value, 1.0);

        // empty bins contribute 2 * nu
        let gof = log_likelihood_ratio(&[2.0], &[0.0], 0);
        assert_relative_eq!(gof.chi2, 4.0);
    }

    #[test]
    fn llr_is_the_non_negative_deviance() {
        let gof = log_likelihood_ratio(&[10.0, 40.0], &[5.0, 50.0], 0);
        let expected = 2.0 * ((10.0 - 5.0 + 5.0 * 0.5_f64.ln()) + (40.0 - 50.0 + 50.0 * 1.25_f64.ln()));
        assert_relative_eq!(gof.chi2, expected, max_relative = 1e-12);
        assert!(gof.chi2 > 0.0);
        assert_eq!(gof.dof, 2);
    }

    #[test]
    fn model_counts_use_bin_width() {
        let hist = Histogram::new(vec![0.0, 1.0, 3.0], vec![0.0, 0.0]).unwrap();
        assert_eq!(model_counts(|_| 2.0, &hist), vec![2.0, 4.0]);
    }
}
