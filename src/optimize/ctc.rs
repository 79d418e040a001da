//! Charge-trapping corrections against drift time.
//!
//! Energy: `energy * (1 + alpha * dt)` with `alpha` chosen to minimize
//! `ln(FWHM / height)` of the corrected peak. LQ: `lq - slope * dt` with `slope` chosen to
//! minimize the truncated-Gaussian width of the corrected distribution. Both searches run
//! a bounded Nelder-Mead over the coefficient, refitting the corrected histogram at every
//! trial value.

use std::fmt;

use super::sweep::{SweepResult, guarded_fit, robust_window, sweep};
use crate::config::{CtcConfig, PeakFitConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result, ensure_same_len};
use crate::fitter::binned::PeakFit;
use crate::fitter::chi2::{Chi2Options, chi2fit_poly};
use crate::fitter::common::FitResult;
use crate::fitter::models::PeakShape;
use crate::fitter::optimizer::Minimizer;
use crate::histoer::histogram1d::Binning;
use crate::util::measurement::Measurement;
use crate::util::statistics;

/// How the drift-time inlier window is chosen before a correction is fitted.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DtCutoffPolicy {
    /// Between two quantiles of the drift-time distribution.
    Percentile { low: f64, high: f64 },
    /// `n_sigma` around a single Gaussian fitted to the drift times.
    SingleGaussian { n_sigma: f64 },
    /// `n_sigma` around the larger component of a double Gaussian.
    DoubleGaussian { n_sigma: f64 },
}

impl DtCutoffPolicy {
    pub fn from_config(config: &CtcConfig) -> Result<Self> {
        let policy = match config.dt_cutoff.as_str() {
            "percentile" => DtCutoffPolicy::Percentile {
                low: config.dt_percentiles.0,
                high: config.dt_percentiles.1,
            },
            "single_gaussian" => DtCutoffPolicy::SingleGaussian {
                n_sigma: config.dt_n_sigma,
            },
            "double_gaussian" => DtCutoffPolicy::DoubleGaussian {
                n_sigma: config.dt_n_sigma,
            },
            other => {
                return Err(CalError::Contract(format!(
                    "unknown drift-time cutoff policy '{other}'"
                )));
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        match *self {
            DtCutoffPolicy::Percentile { low, high } => {
                if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
                    return Err(CalError::Contract(format!(
                        "drift-time percentiles must satisfy 0 <= low < high <= 1, got ({low}, {high})"
                    )));
                }
            }
            DtCutoffPolicy::SingleGaussian { n_sigma } | DtCutoffPolicy::DoubleGaussian { n_sigma } => {
                if !(n_sigma > 0.0) {
                    return Err(CalError::Contract(format!(
                        "drift-time sigma multiplier must be positive, got {n_sigma}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Inlier drift-time window `[low, high]`.
    pub fn window(&self, dt: &[f64], binning: Binning, peak_fit: &PeakFitConfig) -> Result<(f64, f64)> {
        self.validate()?;
        let sorted = statistics::sorted_finite(dt);
        if sorted.len() < 2 {
            return Err(CalError::InsufficientData(
                "fewer than two finite drift times".to_string(),
            ));
        }
        match *self {
            DtCutoffPolicy::Percentile { low, high } => Ok((
                statistics::quantile_sorted(&sorted, low),
                statistics::quantile_sorted(&sorted, high),
            )),
            DtCutoffPolicy::SingleGaussian { n_sigma } => {
                let fit = fit_drift_times(&sorted, PeakShape::GaussOnUniform, binning, peak_fit)?;
                let (mu, sigma) = (fit.mu().value, fit.sigma().value);
                Ok((mu - n_sigma * sigma, mu + n_sigma * sigma))
            }
            DtCutoffPolicy::DoubleGaussian { n_sigma } => {
                let fit = fit_drift_times(&sorted, PeakShape::DoubleGauss, binning, peak_fit)?;
                let p = fit.values();
                let (mu, sigma) = if p[0] >= p[3] { (p[1], p[2]) } else { (p[4], p[5]) };
                Ok((mu - n_sigma * sigma, mu + n_sigma * sigma))
            }
        }
    }
}

fn fit_drift_times(
    sorted: &[f64],
    shape: PeakShape,
    binning: Binning,
    peak_fit: &PeakFitConfig,
) -> Result<PeakFit> {
    let low = statistics::quantile_sorted(sorted, 0.001);
    let high = statistics::quantile_sorted(sorted, 0.999);
    let config = PeakFitConfig {
        shape,
        compute_uncertainty: false,
        ..peak_fit.clone()
    };
    guarded_fit(sorted, (low, high + 1e-9 * high.abs().max(1.0)), binning, &config)
}

/// `energy * (1 + alpha * dt)`
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct ChargeTrappingCorrection {
    pub alpha: f64,
}

impl ChargeTrappingCorrection {
    pub fn apply(&self, energy: f64, dt: f64) -> f64 {
        energy * (1.0 + self.alpha * dt)
    }

    pub fn apply_all(&self, energy: &[f64], dt: &[f64]) -> Result<Vec<f64>> {
        ensure_same_len("ctc energy/dt", energy.len(), dt.len())?;
        Ok(energy.iter().zip(dt).map(|(e, t)| self.apply(*e, *t)).collect())
    }

    /// The correction as text over the given column names.
    pub fn expression(&self, energy: &str, dt: &str) -> String {
        format!("{energy}*(1+{}*{dt})", self.alpha)
    }
}

impl fmt::Display for ChargeTrappingCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression("energy", "dt"))
    }
}

/// `lq - slope * dt`
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct LqCorrection {
    pub slope: f64,
}

impl LqCorrection {
    pub fn apply(&self, lq: f64, dt: f64) -> f64 {
        lq - self.slope * dt
    }

    pub fn apply_all(&self, lq: &[f64], dt: &[f64]) -> Result<Vec<f64>> {
        ensure_same_len("lq correction lq/dt", lq.len(), dt.len())?;
        Ok(lq.iter().zip(dt).map(|(q, t)| self.apply(*q, *t)).collect())
    }

    pub fn expression(&self, lq: &str, dt: &str) -> String {
        if self.slope < 0.0 {
            format!("{lq} + {}*{dt}", -self.slope)
        } else {
            format!("{lq} - {}*{dt}", self.slope)
        }
    }
}

impl fmt::Display for LqCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression("lq", "dt"))
    }
}

/// Median LQ in equal-population drift-time bins with a straight line through them.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DriftTimeProfile {
    /// Median drift time of each bin.
    pub dt: Vec<f64>,
    /// Median LQ of each bin with its standard error.
    pub lq: Vec<Measurement>,
    pub fit: FitResult,
}

impl DriftTimeProfile {
    pub fn build(dt: &[f64], lq: &[f64], n_bins: usize) -> Result<Self> {
        ensure_same_len("profile dt/lq", dt.len(), lq.len())?;
        if n_bins < 2 {
            return Err(CalError::Contract(format!(
                "drift-time profile needs at least 2 bins, got {n_bins}"
            )));
        }
        let mut pairs: Vec<(f64, f64)> = dt
            .iter()
            .zip(lq)
            .filter(|(t, q)| t.is_finite() && q.is_finite())
            .map(|(t, q)| (*t, *q))
            .collect();
        if pairs.len() < 2 * n_bins {
            return Err(CalError::InsufficientData(format!(
                "{} events for {n_bins} drift-time bins",
                pairs.len()
            )));
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut centers = Vec::with_capacity(n_bins);
        let mut medians = Vec::with_capacity(n_bins);
        for k in 0..n_bins {
            let start = k * pairs.len() / n_bins;
            let end = (k + 1) * pairs.len() / n_bins;
            let (times, values): (Vec<f64>, Vec<f64>) = pairs[start..end].iter().copied().unzip();
            let spread = match statistics::robust_sigma(&values) {
                s if s > 0.0 => s,
                _ => statistics::std_dev(&values),
            };
            // standard error of a Gaussian median
            let error = 1.2533 * spread / (values.len() as f64).sqrt();
            centers.push(statistics::median(&times));
            medians.push(Measurement::new(statistics::median(&values), error));
        }

        let x: Vec<Measurement> = centers.iter().map(|t| Measurement::exact(*t)).collect();
        let fit = chi2fit_poly(1, &x, &medians, &Chi2Options::default())?;
        Ok(Self {
            dt: centers,
            lq: medians,
            fit,
        })
    }

    pub fn slope(&self) -> Measurement {
        self.fit.parameters[1]
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnergyCtcResult {
    pub correction: ChargeTrappingCorrection,
    /// Uncertainty is the search tolerance in coefficient units.
    pub alpha: Measurement,
    pub dt_window: (f64, f64),
    pub n_inliers: usize,
    /// `ln(FWHM / height)` without and with the correction.
    pub objective_before: f64,
    pub objective_after: f64,
    pub fwhm_before: Measurement,
    pub fwhm_after: Measurement,
    pub converged: bool,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LqCtcResult {
    pub correction: LqCorrection,
    pub slope: Measurement,
    pub profile: Option<DriftTimeProfile>,
    pub dt_window: (f64, f64),
    pub n_inliers: usize,
    pub sigma_before: Measurement,
    pub sigma_after: Measurement,
    pub converged: bool,
    pub diagnostics: Diagnostics,
}

// Fixed-size histogram frame that follows the corrected peak.
struct PeakFrame {
    half_width: f64,
    n_bins: usize,
}

impl PeakFrame {
    fn new(energies: &[f64], config: &CtcConfig) -> Result<Self> {
        let (low, high) = robust_window(energies, config.window_sigma)?;
        let half_width = 0.5 * (high - low);
        let n_bins = config.binning.number_of_bins(energies, (low, high))?;
        Ok(Self { half_width, n_bins })
    }

    fn fit(&self, corrected: &[f64], config: &PeakFitConfig) -> Result<PeakFit> {
        let center = statistics::median(corrected);
        let window = (center - self.half_width, center + self.half_width);
        guarded_fit(corrected, window, Binning::Count(self.n_bins), config)
    }
}

fn inliers(values: &[f64], dt: &[f64], window: (f64, f64)) -> (Vec<f64>, Vec<f64>) {
    values
        .iter()
        .zip(dt)
        .filter(|(v, t)| v.is_finite() && t.is_finite() && **t >= window.0 && **t <= window.1)
        .map(|(v, t)| (*v, *t))
        .unzip()
}

fn check_bounds(bounds: (f64, f64)) -> Result<()> {
    if !(bounds.0.is_finite() && bounds.1.is_finite() && bounds.0 < bounds.1) {
        return Err(CalError::Contract(format!(
            "correction bounds must be finite and increasing, got {bounds:?}"
        )));
    }
    Ok(())
}

// Shared front half of both corrections: policy, inlier window and guard.
fn select_inliers(
    values: &[f64],
    dt: &[f64],
    config: &CtcConfig,
) -> Result<((f64, f64), Vec<f64>, Vec<f64>)> {
    ensure_same_len("ctc values/dt", values.len(), dt.len())?;
    let policy = DtCutoffPolicy::from_config(config)?;
    let fit_config = PeakFitConfig {
        compute_uncertainty: false,
        ..config.peak_fit.clone()
    };
    let window = policy.window(dt, config.binning, &fit_config)?;
    let (values, times) = inliers(values, dt, window);
    if values.len() < config.min_points.max(1) {
        return Err(CalError::InsufficientData(format!(
            "{} events inside the drift-time window {window:?}, need {}",
            values.len(),
            config.min_points
        )));
    }
    Ok((window, values, times))
}

/// Fits `alpha` in `energy * (1 + alpha * dt)` for events of a single peak.
///
/// Data problems (too few inliers, no fittable peak) give the configured default `alpha`
/// with `converged = false` and a warning instead of an error.
pub fn optimize_energy_ctc(energy: &[f64], dt: &[f64], config: &CtcConfig) -> Result<EnergyCtcResult> {
    check_bounds(config.alpha_bounds)?;
    let mut diagnostics = Diagnostics::new();
    let fallback = |window: (f64, f64), n_inliers: usize, diagnostics: Diagnostics| EnergyCtcResult {
        correction: ChargeTrappingCorrection {
            alpha: config.default_alpha,
        },
        alpha: Measurement::new(config.default_alpha, f64::NAN),
        dt_window: window,
        n_inliers,
        objective_before: f64::NAN,
        objective_after: f64::NAN,
        fwhm_before: Measurement::nan(),
        fwhm_after: Measurement::nan(),
        converged: false,
        diagnostics,
    };

    let (window, energies, times) = match select_inliers(energy, dt, config) {
        Ok(selected) => selected,
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("energy ctc", format!("keeping default alpha: {e}"));
            return Ok(fallback((f64::NAN, f64::NAN), 0, diagnostics));
        }
    };
    let n_inliers = energies.len();

    let frame = match PeakFrame::new(&energies, config) {
        Ok(frame) => frame,
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("energy ctc", format!("keeping default alpha: {e}"));
            return Ok(fallback(window, n_inliers, diagnostics));
        }
    };
    let fit_config = PeakFitConfig {
        compute_uncertainty: false,
        ..config.peak_fit.clone()
    };
    let corrected = |alpha: f64| -> Vec<f64> {
        energies
            .iter()
            .zip(&times)
            .map(|(e, t)| e * (1.0 + alpha * t))
            .collect()
    };
    let objective = |p: &[f64]| -> f64 {
        match frame.fit(&corrected(p[0]), &fit_config) {
            Ok(fit) if fit.height > 0.0 => (fit.fwhm.value / fit.height).ln(),
            Ok(_) | Err(_) => f64::INFINITY,
        }
    };

    let (lo, hi) = config.alpha_bounds;
    let scale = 0.25 * (hi - lo);
    let start = config.default_alpha.clamp(lo, hi);
    let minimum = match Minimizer::new(config.optimizer()).minimize(&objective, &[start], &[scale], &[(lo, hi)]) {
        Ok(minimum) => minimum,
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("energy ctc", format!("keeping default alpha: {e}"));
            return Ok(fallback(window, n_inliers, diagnostics));
        }
    };
    if !minimum.converged {
        diagnostics.warn(
            "energy ctc",
            format!("search stopped before converging: {}", minimum.message),
        );
    }
    let alpha = minimum.parameters[0];

    let fwhm_at = |alpha: f64| -> Measurement {
        let config = PeakFitConfig {
            compute_uncertainty: true,
            ..fit_config.clone()
        };
        frame
            .fit(&corrected(alpha), &config)
            .map(|fit| fit.fwhm)
            .unwrap_or_else(|_| Measurement::nan())
    };
    let result = EnergyCtcResult {
        correction: ChargeTrappingCorrection { alpha },
        alpha: Measurement::new(alpha, config.tol * scale),
        dt_window: window,
        n_inliers,
        objective_before: objective(&[0.0]),
        objective_after: minimum.fval,
        fwhm_before: fwhm_at(0.0),
        fwhm_after: fwhm_at(alpha),
        converged: minimum.converged,
        diagnostics,
    };
    log::info!(
        "energy ctc {}: FWHM {} -> {}",
        result.correction,
        result.fwhm_before,
        result.fwhm_after
    );
    Ok(result)
}

/// Grid version of the energy correction: `ln(FWHM / height)` at each `alpha`.
pub fn energy_ctc_sweep(energy: &[f64], dt: &[f64], alphas: &[f64], config: &CtcConfig) -> Result<SweepResult> {
    let (_, energies, times) = select_inliers(energy, dt, config)?;
    let frame = PeakFrame::new(&energies, config)?;
    sweep("ctc alpha", alphas, Some(config.default_alpha), |_, alpha, _| {
        let correction = ChargeTrappingCorrection { alpha };
        let fit = frame.fit(&correction.apply_all(&energies, &times)?, &config.peak_fit)?;
        if !(fit.height > 0.0) {
            return Err(CalError::Numerical("fitted peak has no height".to_string()));
        }
        Ok(Measurement::new(
            (fit.fwhm.value / fit.height).ln(),
            fit.fwhm.relative_uncertainty(),
        ))
    })
}

/// Truncated-Gaussian width of `values` within `window_sigma` robust widths of the median.
fn truncated_sigma(values: &[f64], config: &CtcConfig, compute_uncertainty: bool) -> Result<Measurement> {
    let window = robust_window(values, config.window_sigma)?;
    let fit_config = PeakFitConfig {
        shape: PeakShape::TruncatedGauss,
        compute_uncertainty,
        ..config.peak_fit.clone()
    };
    Ok(guarded_fit(values, window, config.binning, &fit_config)?.sigma())
}

/// Fits `slope` in `lq - slope * dt`.
///
/// The drift-time profile gives the start point and the search range; the bounded search
/// then minimizes the width of the corrected distribution.
pub fn optimize_lq_ctc(lq: &[f64], dt: &[f64], config: &CtcConfig) -> Result<LqCtcResult> {
    let mut diagnostics = Diagnostics::new();
    let fallback = |window: (f64, f64), n_inliers: usize, diagnostics: Diagnostics| LqCtcResult {
        correction: LqCorrection::default(),
        slope: Measurement::nan(),
        profile: None,
        dt_window: window,
        n_inliers,
        sigma_before: Measurement::nan(),
        sigma_after: Measurement::nan(),
        converged: false,
        diagnostics,
    };

    let (window, values, times) = match select_inliers(lq, dt, config) {
        Ok(selected) => selected,
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("lq ctc", format!("no correction: {e}"));
            return Ok(fallback((f64::NAN, f64::NAN), 0, diagnostics));
        }
    };
    let n_inliers = values.len();

    let profile = match DriftTimeProfile::build(&times, &values, config.profile_bins) {
        Ok(profile) => Some(profile),
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("lq ctc", format!("no drift-time profile: {e}"));
            None
        }
    };
    let start = profile
        .as_ref()
        .map(|p| p.slope())
        .filter(|s| s.value.is_finite())
        .unwrap_or(Measurement::new(0.0, f64::NAN));

    // natural slope unit: spread of lq over spread of dt
    let natural = statistics::robust_sigma(&values) / statistics::robust_sigma(&times);
    let half_range = [
        10.0 * start.uncertainty,
        0.5 * start.value.abs(),
        0.01 * natural,
    ]
    .into_iter()
    .filter(|w| w.is_finite() && *w > 0.0)
    .fold(0.0_f64, f64::max);
    if !(half_range > 0.0) {
        diagnostics.warn("lq ctc", "lq or drift time has no spread, no correction");
        return Ok(fallback(window, n_inliers, diagnostics));
    }
    let bounds = (start.value - half_range, start.value + half_range);

    let corrected = |slope: f64| -> Vec<f64> {
        values
            .iter()
            .zip(&times)
            .map(|(q, t)| q - slope * t)
            .collect()
    };
    let objective = |p: &[f64]| -> f64 {
        match truncated_sigma(&corrected(p[0]), config, false) {
            Ok(sigma) => sigma.value,
            Err(_) => f64::INFINITY,
        }
    };

    let minimizer = Minimizer::new(config.optimizer());
    let scale = 0.25 * half_range;
    let minimum = match minimizer.minimize(&objective, &[start.value], &[scale], &[bounds]) {
        Ok(minimum) => minimum,
        Err(e) if e.is_contract() => return Err(e),
        Err(e) => {
            diagnostics.warn("lq ctc", format!("no correction: {e}"));
            return Ok(LqCtcResult {
                profile,
                ..fallback(window, n_inliers, diagnostics)
            });
        }
    };
    if !minimum.converged {
        diagnostics.warn(
            "lq ctc",
            format!("search stopped before converging: {}", minimum.message),
        );
    }
    let slope = minimum.parameters[0];
    let sigma_at =
        |slope: f64| truncated_sigma(&corrected(slope), config, true).unwrap_or_else(|_| Measurement::nan());

    let result = LqCtcResult {
        correction: LqCorrection { slope },
        slope: Measurement::new(slope, config.tol * scale),
        profile,
        dt_window: window,
        n_inliers,
        sigma_before: sigma_at(0.0),
        sigma_after: sigma_at(slope),
        converged: minimum.converged,
        diagnostics,
    };
    log::info!(
        "lq ctc {}: sigma {} -> {}",
        result.correction,
        result.sigma_before,
        result.sigma_after
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal, Uniform};

    #[test]
    fn unknown_policy_fails_fast() {
        let config = CtcConfig {
            dt_cutoff: "triple_gaussian".to_string(),
            ..CtcConfig::default()
        };
        let err = DtCutoffPolicy::from_config(&config).unwrap_err();
        assert!(err.is_contract());
        // before looking at any data
        assert!(optimize_energy_ctc(&[], &[], &config).unwrap_err().is_contract());
        assert!(optimize_lq_ctc(&[], &[], &config).unwrap_err().is_contract());
    }

    #[test]
    fn policies_parse_from_names() {
        let mut config = CtcConfig::default();
        assert_eq!(
            DtCutoffPolicy::from_config(&config).unwrap(),
            DtCutoffPolicy::Percentile { low: 0.01, high: 0.99 }
        );
        config.dt_cutoff = "double_gaussian".to_string();
        assert_eq!(
            DtCutoffPolicy::from_config(&config).unwrap(),
            DtCutoffPolicy::DoubleGaussian { n_sigma: 3.0 }
        );
        config.dt_percentiles = (0.9, 0.1);
        config.dt_cutoff = "percentile".to_string();
        assert!(DtCutoffPolicy::from_config(&config).is_err());
    }

    #[test]
    fn percentile_window_brackets_the_quantiles() {
        let dt: Vec<f64> = (0..=1000).map(|i| i as f64).collect();
        let policy = DtCutoffPolicy::Percentile { low: 0.05, high: 0.95 };
        let window = policy.window(&dt, Binning::Auto, &PeakFitConfig::default()).unwrap();
        assert_relative_eq!(window.0, 50.0);
        assert_relative_eq!(window.1, 950.0);
    }

    #[test]
    fn gaussian_windows_follow_the_main_population() {
        let mut rng = StdRng::seed_from_u64(8);
        let main = Normal::new(500.0, 20.0).unwrap();
        let slow = Normal::new(700.0, 60.0).unwrap();
        let mut dt: Vec<f64> = (0..20_000).map(|_| main.sample(&mut rng)).collect();
        dt.extend((0..3_000).map(|_| slow.sample(&mut rng)));

        let double = DtCutoffPolicy::DoubleGaussian { n_sigma: 3.0 };
        let (lo, hi) = double.window(&dt, Binning::Auto, &PeakFitConfig::default()).unwrap();
        assert_relative_eq!(0.5 * (lo + hi), 500.0, epsilon = 5.0);
        assert_relative_eq!(hi - lo, 120.0, max_relative = 0.2);

        let single = DtCutoffPolicy::SingleGaussian { n_sigma: 3.0 };
        let (lo, hi) = single.window(&dt, Binning::Auto, &PeakFitConfig::default()).unwrap();
        assert!(lo < 500.0 && hi > 500.0);
    }

    #[test]
    fn corrections_apply_and_render() {
        let ctc = ChargeTrappingCorrection { alpha: 2e-6 };
        assert_relative_eq!(ctc.apply(1000.0, 500.0), 1001.0, max_relative = 1e-12);
        assert_eq!(ctc.to_string(), "energy*(1+0.000002*dt)");
        assert_eq!(ctc.expression("cuspEmax", "dt_eff"), "cuspEmax*(1+0.000002*dt_eff)");
        assert!(ctc.apply_all(&[1.0], &[]).unwrap_err().is_contract());

        let lq = LqCorrection { slope: 0.5 };
        assert_relative_eq!(lq.apply(3.0, 2.0), 2.0);
        assert_eq!(lq.to_string(), "lq - 0.5*dt");
        assert_eq!(LqCorrection { slope: -0.25 }.to_string(), "lq + 0.25*dt");
    }

    #[test]
    fn profile_follows_linear_drift() {
        let mut rng = StdRng::seed_from_u64(4);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let uniform = Uniform::new(200.0, 1200.0);
        let dt: Vec<f64> = (0..20_000).map(|_| uniform.sample(&mut rng)).collect();
        let lq: Vec<f64> = dt.iter().map(|t| 1.0 + 1e-3 * t + noise.sample(&mut rng)).collect();

        let profile = DriftTimeProfile::build(&dt, &lq, 10).unwrap();
        assert_eq!(profile.lq.len(), 10);
        assert_relative_eq!(profile.slope().value, 1e-3, max_relative = 0.03);
        assert!(profile.dt.windows(2).all(|w| w[0] < w[1]));

        assert!(DriftTimeProfile::build(&dt, &lq, 1).unwrap_err().is_contract());
        assert!(matches!(
            DriftTimeProfile::build(&dt[..5], &lq[..5], 10),
            Err(CalError::InsufficientData(_))
        ));
    }

    #[test]
    fn oversized_frame_binning_is_rejected() {
        let (energy, dt) = trapped_line(2_000, 34);
        let config = CtcConfig {
            binning: Binning::Width(1e-9),
            ..CtcConfig::default()
        };
        assert!(optimize_energy_ctc(&energy, &dt, &config).unwrap_err().is_contract());
        assert!(energy_ctc_sweep(&energy, &dt, &[0.0], &config).unwrap_err().is_contract());
    }

    #[test]
    fn too_few_inliers_keep_the_default() {
        let config = CtcConfig {
            default_alpha: 1e-6,
            ..CtcConfig::default()
        };
        let result = optimize_energy_ctc(&[2614.0; 10], &[500.0; 10], &config).unwrap();
        assert_eq!(result.correction.alpha, 1e-6);
        assert!(!result.converged);
        assert!(result.diagnostics.has_warnings());
    }

    fn trapped_line(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let uniform = Uniform::new(200.0, 1200.0);
        let line = Normal::new(2614.0, 1.0).unwrap();
        let dt: Vec<f64> = (0..n).map(|_| uniform.sample(&mut rng)).collect();
        let energy = dt
            .iter()
            .map(|t| line.sample(&mut rng) * (1.0 - 2e-6 * t))
            .collect();
        (energy, dt)
    }

    #[test]
    fn alpha_grid_picks_the_point_nearest_the_trapping() {
        let (energy, dt) = trapped_line(20_000, 31);
        let config = CtcConfig {
            binning: Binning::Width(0.25),
            ..CtcConfig::default()
        };
        let alphas = [0.0, 1e-6, 2e-6, 3e-6, 4e-6];
        let result = energy_ctc_sweep(&energy, &dt, &alphas, &config).unwrap();
        assert_eq!(result.optimum.value, 2e-6);
        assert_relative_eq!(result.optimum.uncertainty, 1e-6, max_relative = 1e-9);
        assert_eq!(result.n_valid(), alphas.len());
        assert!(result.points[0].metric.value > result.metric.value);
    }

    #[test]
    fn alpha_grid_without_a_fittable_point_falls_back() {
        let (energy, dt) = trapped_line(20_000, 32);
        // every event inside the window, so the corrected median falls between two events
        let config = CtcConfig {
            dt_percentiles: (0.0, 1.0),
            default_alpha: 5e-7,
            binning: Binning::Width(0.25),
            ..CtcConfig::default()
        };
        // corrections this large scatter the events far apart, leaving the frame empty
        let result = energy_ctc_sweep(&energy, &dt, &[1e3, 2e3], &config).unwrap();
        assert_eq!(result.optimum.value, 5e-7);
        assert!(result.optimum.uncertainty.is_nan());
        assert!(result.metric.value.is_nan());
        assert!(result.diagnostics.has_warnings());
    }

    #[test]
    fn alpha_grid_rejects_unknown_policy() {
        let (energy, dt) = trapped_line(1_000, 33);
        let config = CtcConfig {
            dt_cutoff: "quartile".to_string(),
            ..CtcConfig::default()
        };
        let err = energy_ctc_sweep(&energy, &dt, &[0.0, 1e-6], &config).unwrap_err();
        assert!(err.is_contract());
    }
}
