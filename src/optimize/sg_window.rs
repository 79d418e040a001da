//! SEP survival fraction against Savitzky-Golay window length.
//!
//! For each window length the PSD cut is placed where it keeps the configured fraction of
//! double-escape (DEP, signal-like) events, and the metric is the fraction of fitted
//! single-escape (SEP, background-like) peak counts that survive it.

use super::sweep::{SweepResult, finite_samples, sweep};
use crate::config::SurvivalFractionConfig;
use crate::error::{CalError, Result, ensure_same_len};
use crate::fitter::binned::{PeakFit, fit_peak_from};
use crate::histoer::histogram1d::{Binning, Histogram};
use crate::histoer::peak_stats::PeakStats;
use crate::util::measurement::Measurement;
use crate::util::statistics;

/// PSD values of DEP events and (PSD, energy) of events around the SEP for one setting.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SurvivalInput {
    pub dep_psd: Vec<f64>,
    pub sep_psd: Vec<f64>,
    pub sep_energy: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SurvivalFraction {
    /// Events with PSD at or above this value pass.
    pub cut_value: f64,
    pub counts_before: Measurement,
    pub counts_after: Measurement,
    /// Binomial uncertainty on the fitted-count ratio.
    pub fraction: Measurement,
}

pub fn survival_fraction(input: &SurvivalInput, config: &SurvivalFractionConfig) -> Result<SurvivalFraction> {
    ensure_same_len("SEP psd/energy", input.sep_psd.len(), input.sep_energy.len())?;
    if !(config.dep_acceptance > 0.0 && config.dep_acceptance <= 1.0) {
        return Err(CalError::Contract(format!(
            "DEP acceptance must lie in (0, 1], got {}",
            config.dep_acceptance
        )));
    }

    let dep = finite_samples(&input.dep_psd, config.min_points)?;
    let cut_value = statistics::quantile(&dep, 1.0 - config.dep_acceptance);

    let (energies, passed): (Vec<f64>, Vec<bool>) = input
        .sep_energy
        .iter()
        .zip(&input.sep_psd)
        .filter(|(e, psd)| e.is_finite() && psd.is_finite())
        .map(|(e, psd)| (*e, *psd >= cut_value))
        .unzip();
    if energies.len() < config.min_points.max(1) {
        return Err(CalError::InsufficientData(format!(
            "{} SEP events, need {}",
            energies.len(),
            config.min_points
        )));
    }

    let sorted = statistics::sorted_finite(&energies);
    let lo = sorted[0];
    let hi = sorted[sorted.len() - 1];
    if !(hi > lo) {
        return Err(CalError::InsufficientData("SEP energies have no spread".to_string()));
    }
    // nudge the top edge so the largest energy lands in the last bin
    let range = (lo, hi + 1e-9 * hi.abs().max(1.0));

    let before_hist = Histogram::from_samples(&energies, range, config.binning)?;
    let stats = PeakStats::estimate(&before_hist)?;
    if stats.is_degenerate() {
        return Err(CalError::InsufficientData("no SEP peak estimate".to_string()));
    }
    let shape = config.peak_fit.shape;
    let guess = shape.initial_guess(&stats, before_hist.total(), before_hist.range());
    let before = fit_peak_from(&before_hist, &guess, &config.peak_fit)?;
    let n_before = before.n_signal();
    if !(n_before.value > 0.0) {
        return Err(CalError::InsufficientData("no SEP signal before the cut".to_string()));
    }

    let kept: Vec<f64> = energies
        .iter()
        .zip(&passed)
        .filter_map(|(e, p)| p.then_some(*e))
        .collect();
    let n_after = if kept.is_empty() {
        Measurement::exact(0.0)
    } else {
        let after_hist = Histogram::from_samples(&kept, range, Binning::Count(before_hist.n_bins()))?;
        fit_after_cut(&after_hist, &before, kept.len() as f64 / energies.len() as f64, config)?
            .n_signal()
    };

    let ratio = (n_after.value / n_before.value).max(0.0);
    let bounded = ratio.clamp(0.0, 1.0);
    let uncertainty = if kept.is_empty() {
        1.0 / n_before.value
    } else {
        (bounded * (1.0 - bounded) / n_before.value).sqrt()
    };
    log::debug!(
        "cut {cut_value:.4}: SEP {} -> {}, survival {ratio:.4}",
        n_before,
        n_after
    );

    Ok(SurvivalFraction {
        cut_value,
        counts_before: n_before,
        counts_after: n_after,
        fraction: Measurement::new(ratio, uncertainty),
    })
}

// start from the uncut fit with every count parameter scaled by the raw pass fraction
fn fit_after_cut(
    hist: &Histogram,
    before: &PeakFit,
    pass_fraction: f64,
    config: &SurvivalFractionConfig,
) -> Result<PeakFit> {
    let mut guess = before.values();
    for &i in before.shape.count_parameters() {
        guess[i] *= pass_fraction;
    }
    fit_peak_from(hist, &guess, &config.peak_fit)
}

/// `inputs[i]` holds the events processed with window length `windows[i]`.
pub fn sg_window_sweep(
    windows: &[f64],
    inputs: &[SurvivalInput],
    config: &SurvivalFractionConfig,
) -> Result<SweepResult> {
    ensure_same_len("window lengths/inputs", windows.len(), inputs.len())?;
    sweep("sg window", windows, config.default_value, |index, _, _| {
        Ok(survival_fraction(&inputs[index], config)?.fraction)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal, Uniform};

    /// SEP peak events whose PSD sits `shift` below the DEP distribution.
    fn synthetic(shift: f64, seed: u64) -> SurvivalInput {
        let mut rng = StdRng::seed_from_u64(seed);
        let psd = Normal::new(0.0, 1.0).unwrap();
        let peak = Normal::new(2103.5, 1.2).unwrap();
        let flat = Uniform::new(2090.0, 2117.0);

        let dep_psd = (0..10_000).map(|_| psd.sample(&mut rng)).collect();
        let mut sep_psd = Vec::new();
        let mut sep_energy = Vec::new();
        for _ in 0..8_000 {
            sep_energy.push(peak.sample(&mut rng));
            sep_psd.push(psd.sample(&mut rng) - shift);
        }
        for _ in 0..2_000 {
            sep_energy.push(flat.sample(&mut rng));
            sep_psd.push(rng.gen_range(-3.0..3.0));
        }
        SurvivalInput {
            dep_psd,
            sep_psd,
            sep_energy,
        }
    }

    #[test]
    fn same_psd_distribution_survives_at_the_acceptance() {
        let config = SurvivalFractionConfig::default();
        let result = survival_fraction(&synthetic(0.0, 1), &config).unwrap();
        assert_relative_eq!(result.fraction.value, 0.9, epsilon = 0.02);
        assert!(result.fraction.uncertainty > 0.0 && result.fraction.uncertainty < 0.01);
    }

    #[test]
    fn better_separation_means_lower_survival() {
        let config = SurvivalFractionConfig::default();
        let windows = [5.0, 10.0, 15.0];
        let inputs = vec![synthetic(0.5, 2), synthetic(2.0, 3), synthetic(1.0, 4)];
        let result = sg_window_sweep(&windows, &inputs, &config).unwrap();
        assert_eq!(result.optimum.value, 10.0);
        assert!(result.metric.value < 0.5);
    }

    #[test]
    fn acceptance_outside_unit_interval_is_a_contract_error() {
        let config = SurvivalFractionConfig {
            dep_acceptance: 1.5,
            ..SurvivalFractionConfig::default()
        };
        assert!(survival_fraction(&synthetic(0.0, 5), &config).unwrap_err().is_contract());
    }
}
