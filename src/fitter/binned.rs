//! Binned maximum-likelihood fits of peakshapes to histograms.

use super::common::FitResult;
use super::goodness::{self, GoodnessMethod};
use super::models::{Components, PeakShape};
use super::optimizer::{self, Minimizer};
use crate::config::PeakFitConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result};
use crate::histoer::histogram1d::Histogram;
use crate::histoer::peak_stats::PeakStats;
use crate::util::measurement::Measurement;

const MIN_EXPECTED: f64 = 1e-12;

/// Expected counts per bin: density at the bin center times the bin width.
pub fn expected_counts(shape: PeakShape, params: &[f64], hist: &Histogram) -> Vec<f64> {
    let range = hist.range();
    hist.centers()
        .iter()
        .zip(hist.widths())
        .map(|(x, w)| shape.density(*x, params, range) * w)
        .collect()
}

/// Per-bin `nu - n + n ln(n / nu)`, the Poisson NLL minus its saturated value.
pub fn deviance_terms(expected: &[f64], observed: &[f64]) -> Vec<f64> {
    expected
        .iter()
        .zip(observed)
        .map(|(nu, n)| {
            let nu = nu.max(MIN_EXPECTED);
            if *n > 0.0 { nu - n + n * (n / nu).ln() } else { nu }
        })
        .collect()
}

pub fn binned_nll(shape: PeakShape, params: &[f64], hist: &Histogram) -> f64 {
    let expected = expected_counts(shape, params, hist);
    deviance_terms(&expected, &hist.counts).iter().sum()
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PeakFit {
    pub shape: PeakShape,
    pub range: (f64, f64),
    pub result: FitResult,
    pub initial_guess: Vec<f64>,
    pub fwhm: Measurement,
    /// Maximum of the fitted signal density.
    pub height: f64,
}

impl PeakFit {
    pub fn mu(&self) -> Measurement {
        self.result.parameters[PeakShape::MU]
    }

    pub fn sigma(&self) -> Measurement {
        self.result.parameters[PeakShape::SIGMA]
    }

    pub fn n_signal(&self) -> Measurement {
        self.result.parameters[PeakShape::N_SIGNAL]
    }

    pub fn values(&self) -> Vec<f64> {
        self.result.values()
    }

    fn components(&self, x: f64) -> Components {
        self.shape.components(x, &self.values(), self.range)
    }

    /// Fitted density in counts per x unit.
    pub fn total(&self) -> impl Fn(f64) -> f64 + '_ {
        move |x| self.components(x).total()
    }

    pub fn signal(&self) -> impl Fn(f64) -> f64 + '_ {
        move |x| self.components(x).signal
    }

    pub fn tail(&self) -> impl Fn(f64) -> f64 + '_ {
        move |x| self.components(x).tail
    }

    pub fn background(&self) -> impl Fn(f64) -> f64 + '_ {
        move |x| self.components(x).background
    }

    /// Per-bin view of the fit for plotting and residual checks.
    pub fn report(&self, hist: &Histogram) -> PeakFitReport {
        let counts_of = |f: &dyn Fn(f64) -> f64| goodness::model_counts(f, hist);
        PeakFitReport {
            histogram: hist.clone(),
            expected: counts_of(&self.total()),
            signal: counts_of(&self.signal()),
            tail: counts_of(&self.tail()),
            background: counts_of(&self.background()),
            parameters: self
                .result
                .names
                .iter()
                .cloned()
                .zip(self.result.parameters.iter().copied())
                .collect(),
            fwhm: self.fwhm,
            goodness: self.result.goodness.clone(),
        }
    }
}

/// Fitted model evaluated on the fit histogram.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PeakFitReport {
    pub histogram: Histogram,
    /// Expected counts per bin of the full model and of each component.
    pub expected: Vec<f64>,
    pub signal: Vec<f64>,
    pub tail: Vec<f64>,
    pub background: Vec<f64>,
    pub parameters: Vec<(String, Measurement)>,
    pub fwhm: Measurement,
    pub goodness: Option<super::common::GoodnessOfFit>,
}

/// Fit `config.shape` to `hist`, starting from a histogram peak estimate.
pub fn fit_peak(hist: &Histogram, config: &PeakFitConfig) -> Result<PeakFit> {
    let stats = PeakStats::estimate(hist)?;
    let guess = config.shape.initial_guess(&stats, hist.total(), hist.range());
    fit_peak_from(hist, &guess, config)
}

/// Fit `config.shape` to `hist` from an explicit start point.
pub fn fit_peak_from(hist: &Histogram, guess: &[f64], config: &PeakFitConfig) -> Result<PeakFit> {
    let shape = config.shape;
    if guess.len() != shape.n_params() {
        return Err(CalError::Contract(format!(
            "{shape:?} takes {} parameters, guess has {}",
            shape.n_params(),
            guess.len()
        )));
    }
    if hist.total() <= 0.0 {
        return Err(CalError::contract("cannot fit a histogram with zero counts"));
    }

    let range = hist.range();
    let mut diagnostics = Diagnostics::new();
    let bounds = shape.bounds(guess, range);
    let scales = shape.scales(guess);
    let objective = |p: &[f64]| binned_nll(shape, p, hist);

    let minimum = Minimizer::new(config.optimizer.clone()).minimize(&objective, guess, &scales, &bounds)?;
    if !minimum.converged {
        diagnostics.warn(
            "peak fit",
            format!("minimizer did not converge: {}", minimum.message),
        );
    }
    let best = minimum.parameters;
    for ((name, value), (lo, hi)) in shape.parameter_names().iter().zip(&best).zip(&bounds) {
        if (value - lo).abs() <= 1e-9 * lo.abs().max(1.0) || (value - hi).abs() <= 1e-9 * hi.abs().max(1.0) {
            diagnostics.info("peak fit", format!("{name} = {value} sits on its bound"));
        }
    }

    let names: Vec<String> = shape.parameter_names().iter().map(|n| n.to_string()).collect();
    let fwhm_value = shape.fwhm(&best);
    let height = shape.peak_height(&best, range);

    let (parameters, covariance, fwhm) = if config.compute_uncertainty {
        let steps: Vec<f64> = shape.scales(&best).iter().map(|s| 1e-3 * s).collect();
        let covariance = optimizer::hessian(&objective, &best, &steps)
            .and_then(|h| optimizer::covariance_from_hessian(&h, 0.5));
        match covariance {
            Ok(cov) => {
                let errors = optimizer::uncertainties(&cov);
                let parameters = best
                    .iter()
                    .zip(&errors)
                    .map(|(v, e)| Measurement::new(*v, *e))
                    .collect();
                let fwhm_error = fwhm_uncertainty(shape, &best, &steps, &cov);
                (parameters, Some(cov), Measurement::new(fwhm_value, fwhm_error))
            }
            Err(e) => {
                diagnostics.warn("peak fit", format!("no covariance: {e}"));
                let parameters = best
                    .iter()
                    .map(|v| Measurement::new(*v, f64::NAN))
                    .collect();
                (parameters, None, Measurement::new(fwhm_value, f64::NAN))
            }
        }
    } else {
        let parameters = best.iter().map(|v| Measurement::exact(*v)).collect();
        (parameters, None, Measurement::exact(fwhm_value))
    };

    let expected = expected_counts(shape, &best, hist);
    let goodness = match config.goodness {
        GoodnessMethod::None => None,
        GoodnessMethod::LeastSquares => Some(goodness::least_squares(
            &expected,
            &hist.counts,
            shape.n_params(),
            &mut diagnostics,
        )),
        GoodnessMethod::LogLikelihoodRatio => Some(goodness::log_likelihood_ratio(
            &expected,
            &hist.counts,
            shape.n_params(),
        )),
        GoodnessMethod::MonteCarlo => Some(goodness::monte_carlo(
            hist,
            &best,
            config,
            config.mc_samples,
            config.seed,
            &mut diagnostics,
        )?),
    };

    log::debug!(
        "{shape:?} fit on [{:.3}, {:.3}]: {:?}, nll {:.3}",
        range.0,
        range.1,
        best,
        minimum.fval
    );

    Ok(PeakFit {
        shape,
        range,
        result: FitResult {
            names,
            parameters,
            covariance,
            goodness,
            fval: minimum.fval,
            converged: minimum.converged,
            diagnostics,
        },
        initial_guess: guess.to_vec(),
        fwhm,
        height,
    })
}

// sqrt(J C J^T) with J the numerical gradient of the FWHM
fn fwhm_uncertainty(
    shape: PeakShape,
    best: &[f64],
    steps: &[f64],
    cov: &nalgebra::DMatrix<f64>,
) -> f64 {
    let mut shifted = best.to_vec();
    let jacobian: Vec<f64> = (0..best.len())
        .map(|i| {
            let h = 10.0 * steps[i];
            shifted[i] = best[i] + h;
            let up = shape.fwhm(&shifted);
            shifted[i] = best[i] - h;
            let down = shape.fwhm(&shifted);
            shifted[i] = best[i];
            (up - down) / (2.0 * h)
        })
        .collect();
    let j = nalgebra::DVector::from_vec(jacobian);
    (j.transpose() * cov * &j)[(0, 0)].abs().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::models::gaussian::gauss_pdf;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal, Poisson};

    fn poisson_peak(seed: u64, mu: f64, sigma: f64, n_sig: f64, bkg_per_bin: f64) -> Histogram {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut hist = Histogram::uniform((mu - 8.0 * sigma, mu + 8.0 * sigma), 160).unwrap();
        let centers = hist.centers();
        let width = hist.bin_width(0);
        for (count, x) in hist.counts.iter_mut().zip(centers) {
            let nu = n_sig * gauss_pdf(x, mu, sigma) * width + bkg_per_bin;
            *count = Poisson::new(nu).unwrap().sample(&mut rng);
        }
        hist
    }

    #[test]
    fn recovers_gaussian_on_flat_background() {
        let hist = poisson_peak(3, 1000.0, 2.0, 20_000.0, 20.0);
        let fit = fit_peak(&hist, &PeakFitConfig::default()).unwrap();
        let mu = fit.mu();
        let sigma = fit.sigma();
        assert!((mu.value - 1000.0).abs() < 4.0 * mu.uncertainty, "mu {mu}");
        assert!((sigma.value - 2.0).abs() < 4.0 * sigma.uncertainty, "sigma {sigma}");
        assert!((fit.n_signal().value - 20_000.0).abs() < 4.0 * fit.n_signal().uncertainty);
        assert!(fit.fwhm.uncertainty > 0.0);
        let n_bkg = fit.result.get("n_bkg").unwrap();
        assert!((n_bkg.value - 3200.0).abs() < 4.0 * n_bkg.uncertainty, "n_bkg {n_bkg}");
        assert!(fit.result.converged);
        assert!(fit.result.p_value().unwrap() > 1e-4);
    }

    #[test]
    fn truncated_gauss_recovers_noise_width() {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 3.0).unwrap();
        let samples: Vec<f64> = (0..20_000).map(|_| normal.sample(&mut rng)).collect();
        let hist = Histogram::from_samples(&samples, (-4.0, 6.0), crate::histoer::histogram1d::Binning::Count(50)).unwrap();
        let config = PeakFitConfig {
            shape: PeakShape::TruncatedGauss,
            ..PeakFitConfig::default()
        };
        let fit = fit_peak(&hist, &config).unwrap();
        assert!((fit.sigma().value - 3.0).abs() < 4.0 * fit.sigma().uncertainty, "sigma {}", fit.sigma());
        assert!(fit.mu().value.abs() < 4.0 * fit.mu().uncertainty, "mu {}", fit.mu());
    }

    #[test]
    fn refit_from_optimum_is_a_fixed_point() {
        let hist = poisson_peak(9, 500.0, 1.5, 5000.0, 10.0);
        let config = PeakFitConfig::default();
        let first = fit_peak(&hist, &config).unwrap();
        let second = fit_peak_from(&hist, &first.values(), &config).unwrap();
        for (a, b) in first.result.parameters.iter().zip(&second.result.parameters) {
            assert!((a.value - b.value).abs() < 1e-2 * a.uncertainty, "{a} vs {b}");
        }
    }

    #[test]
    fn hpge_shape_fits_and_reports_components() {
        let hist = poisson_peak(21, 2614.0, 1.2, 30_000.0, 15.0);
        let config = PeakFitConfig {
            shape: PeakShape::HpgePeak,
            ..PeakFitConfig::default()
        };
        let fit = fit_peak(&hist, &config).unwrap();
        assert!((fit.mu().value - 2614.0).abs() < 0.1);
        assert!((fit.fwhm.value - 1.2 * 2.3548).abs() < 0.2, "fwhm {}", fit.fwhm);

        let report = fit.report(&hist);
        assert_eq!(report.expected.len(), hist.n_bins());
        for i in 0..hist.n_bins() {
            let sum = report.signal[i] + report.tail[i] + report.background[i];
            assert!((sum - report.expected[i]).abs() < 1e-9 * report.expected[i].max(1.0));
        }
        assert_eq!(report.parameters.len(), 7);
    }

    #[test]
    fn empty_histogram_fails_fast() {
        let hist = Histogram::uniform((0.0, 10.0), 10).unwrap();
        let err = fit_peak(&hist, &PeakFitConfig::default()).unwrap_err();
        assert!(err.is_contract());
    }
}
