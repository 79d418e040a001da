//! Peak FWHM against filter flat-top time.

use super::sweep::{SweepResult, finite_samples, guarded_fit, sweep};
use crate::config::SweepConfig;
use crate::error::{CalError, Result, ensure_same_len};
use crate::fitter::binned::PeakFit;
use crate::histoer::cuts::WindowCut;

/// Fits the dominant peak of one set of uncalibrated energies.
pub fn fit_dominant_peak(energies: &[f64], config: &SweepConfig) -> Result<PeakFit> {
    let samples = finite_samples(energies, config.min_points)?;
    let window = WindowCut::around_peak("peak", "energy", &samples, config.window_sigma)?;
    guarded_fit(&samples, (window.low, window.high), config.binning, &config.peak_fit)
}

/// `energies[i]` holds the peak energies obtained with flat-top time `flat_tops[i]`.
///
/// The metric is the fitted FWHM in the units of the energies.
pub fn fwhm_sweep(flat_tops: &[f64], energies: &[Vec<f64>], config: &SweepConfig) -> Result<SweepResult> {
    ensure_same_len("flat-top times/energy sets", flat_tops.len(), energies.len())?;
    sweep("flat top", flat_tops, config.default_value, |index, _, diagnostics| {
        let fit = fit_dominant_peak(&energies[index], config)?;
        if !fit.result.converged {
            diagnostics.warn("flat top", "peak fit did not converge, keeping its FWHM");
        }
        if !fit.fwhm.value.is_finite() {
            return Err(CalError::Numerical("fitted FWHM is not finite".to_string()));
        }
        Ok(fit.fwhm)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal, Uniform};

    fn peak_on_flat(sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(1000.0, sigma).unwrap();
        let flat = Uniform::new(950.0, 1050.0);
        let mut samples: Vec<f64> = (0..8000).map(|_| normal.sample(&mut rng)).collect();
        samples.extend((0..2000).map(|_| flat.sample(&mut rng)));
        samples
    }

    #[test]
    fn fitted_fwhm_matches_generated_width() {
        let fit = fit_dominant_peak(&peak_on_flat(2.0, 1), &SweepConfig::default()).unwrap();
        assert_relative_eq!(fit.fwhm.value, 2.0 * 2.354_820_045, max_relative = 0.05);
    }

    #[test]
    fn sharpest_flat_top_wins() {
        let flat_tops = [0.5, 1.0, 1.5, 2.0];
        let widths = [3.0, 2.0, 1.2, 1.8];
        let energies: Vec<Vec<f64>> = widths
            .iter()
            .enumerate()
            .map(|(i, w)| peak_on_flat(*w, 20 + i as u64))
            .collect();
        let result = fwhm_sweep(&flat_tops, &energies, &SweepConfig::default()).unwrap();
        assert_eq!(result.optimum.value, 1.5);
        assert_relative_eq!(result.optimum.uncertainty, 0.5);
        assert_eq!(result.n_valid(), 4);
    }
}
