//! Equivalent noise charge against filter rise time.

use super::sweep::{SweepResult, finite_samples, guarded_fit, robust_window, sweep};
use crate::config::{PeakFitConfig, SweepConfig};
use crate::error::{Result, ensure_same_len};
use crate::fitter::models::PeakShape;
use crate::util::measurement::Measurement;

/// Noise width of one set of filtered baseline samples.
///
/// A truncated Gaussian is fitted within `window_sigma` robust widths of the median and
/// its sigma is returned.
pub fn noise_sigma(noise: &[f64], config: &SweepConfig) -> Result<Measurement> {
    let samples = finite_samples(noise, config.min_points)?;
    let window = robust_window(&samples, config.window_sigma)?;
    let fit_config = PeakFitConfig {
        shape: PeakShape::TruncatedGauss,
        ..config.peak_fit.clone()
    };
    let fit = guarded_fit(&samples, window, config.binning, &fit_config)?;
    Ok(fit.sigma())
}

/// `noise[i]` holds the filter output on baseline samples at `rise_times[i]`.
pub fn enc_sweep(rise_times: &[f64], noise: &[Vec<f64>], config: &SweepConfig) -> Result<SweepResult> {
    ensure_same_len("enc rise times/noise sets", rise_times.len(), noise.len())?;
    sweep("rise time", rise_times, config.default_value, |index, _, diagnostics| {
        let sigma = noise_sigma(&noise[index], config)?;
        if sigma.relative_uncertainty() > 0.5 {
            diagnostics.warn("rise time", format!("poorly constrained noise width {sigma}"));
        }
        Ok(sigma)
    })
}
