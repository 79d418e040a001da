//! Energy calibration from peak fits at known reference lines.

use nalgebra::DMatrix;

use super::function::CalibrationFunction;
use crate::config::CalibrationConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result, ensure_same_len};
use crate::fitter::binned::{PeakFit, fit_peak_from};
use crate::fitter::chi2::{Chi2Options, chi2fit_composed, chi2fit_poly, polynomial_guess};
use crate::fitter::common::FitResult;
use crate::histoer::histogram1d::{Binning, Histogram};
use crate::histoer::peak_finder::{RoughCalibration, match_reference_peaks};
use crate::histoer::peak_stats::PeakStats;
use crate::util::dual::Dual;
use crate::util::measurement::Measurement;
use crate::util::statistics;

/// Fewer samples than this in a fit window skips the line.
const MIN_WINDOW_COUNTS: usize = 20;

/// Fitted raw-to-energy polynomial.
///
/// The polynomial is fitted in `x / scale` with `scale` the largest calibration position,
/// so the coefficients of [`CalibrationCurve::fit`] refer to that ratio.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CalibrationCurve {
    pub function: CalibrationFunction,
    pub fit: FitResult,
    /// Raw positions spanned by the calibration points.
    pub domain: (f64, f64),
}

impl CalibrationCurve {
    pub fn fit(
        positions: &[Measurement],
        energies: &[Measurement],
        degree: usize,
        options: &Chi2Options,
    ) -> Result<Self> {
        ensure_same_len("calibration positions/energies", positions.len(), energies.len())?;
        if positions.len() < degree + 1 {
            return Err(CalError::InsufficientData(format!(
                "degree {degree} calibration needs {} points, got {}",
                degree + 1,
                positions.len()
            )));
        }
        let scale = positions.iter().fold(0.0_f64, |m, p| m.max(p.value.abs()));
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(CalError::InsufficientData(
                "calibration positions are all zero or not finite".to_string(),
            ));
        }
        let ratios: Vec<Measurement> = positions.iter().map(|p| *p / scale).collect();
        let fit = chi2fit_poly(degree, &ratios, energies, options)?;
        let function = CalibrationFunction::polynomial_of_ratio(fit.values(), scale)?;

        let domain = positions.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.value), hi.max(p.value))
        });
        match &fit.goodness {
            Some(g) => log::info!(
                "calibration {function}: chi2 {:.2} / {} dof, p = {:.3}",
                g.chi2,
                g.dof,
                g.p_value
            ),
            None => log::info!("calibration {function}"),
        }

        Ok(Self {
            function,
            fit,
            domain,
        })
    }

    /// Coefficient covariance, or a diagonal one built from the coefficient uncertainties.
    pub fn covariance(&self) -> Option<DMatrix<f64>> {
        if let Some(cov) = &self.fit.covariance {
            return Some(cov.clone());
        }
        let variances: Vec<f64> = self.fit.parameters.iter().map(|p| p.variance()).collect();
        variances
            .iter()
            .all(|v| v.is_finite())
            .then(|| DMatrix::from_diagonal(&nalgebra::DVector::from_vec(variances)))
    }

    pub fn energy(&self, raw: Measurement) -> Result<Measurement> {
        self.function.propagate(raw, self.covariance().as_ref())
    }

    pub fn slope_at(&self, raw: f64) -> f64 {
        self.function.derivative(raw)
    }

    /// Raw position of `energy`, searched from zero to twice the calibrated domain.
    pub fn invert(&self, energy: f64) -> Option<f64> {
        let (lo, hi) = self.domain;
        let span = (hi - lo).max(hi.abs());
        self.function.invert(energy, (lo.min(0.0) - span, hi + span))
    }

    /// `f(position) - energy` for each calibration point.
    pub fn residuals(&self, positions: &[f64], energies: &[f64]) -> Result<Vec<f64>> {
        ensure_same_len("residual positions/energies", positions.len(), energies.len())?;
        Ok(positions
            .iter()
            .zip(energies)
            .map(|(x, e)| self.function.eval(*x) - e)
            .collect())
    }

    pub fn p_value(&self) -> Option<f64> {
        self.fit.p_value()
    }
}

/// `FWHM(E) = sqrt(a + b*E)`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ResolutionCurve {
    pub fit: FitResult,
}

impl ResolutionCurve {
    pub fn fit(energies: &[f64], fwhm: &[Measurement]) -> Result<Self> {
        ensure_same_len("resolution energies/fwhm", energies.len(), fwhm.len())?;
        if energies.len() < 2 {
            return Err(CalError::InsufficientData(format!(
                "resolution curve needs 2 peaks, got {}",
                energies.len()
            )));
        }
        let squared: Vec<f64> = fwhm.iter().map(|w| w.value * w.value).collect();
        let mean_squared = statistics::mean(&squared);
        let guess = polynomial_guess(1, energies, &squared)
            .filter(|g| energies.iter().all(|e| g[0] + g[1] * e > 0.0))
            .unwrap_or_else(|| vec![mean_squared, 0.0]);

        let x: Vec<Measurement> = energies.iter().map(|e| Measurement::exact(*e)).collect();
        let options = Chi2Options::default().with_guess(guess);
        let mut fit = chi2fit_composed(1, Dual::sqrt, &x, fwhm, &options)?;
        fit.names = vec!["a".to_string(), "b".to_string()];
        Ok(Self { fit })
    }

    pub fn a(&self) -> Measurement {
        self.fit.parameters[0]
    }

    pub fn b(&self) -> Measurement {
        self.fit.parameters[1]
    }

    pub fn fwhm_at(&self, energy: f64) -> Measurement {
        let (a, b) = (self.a(), self.b());
        let value = (a.value + b.value * energy).sqrt();
        let jacobian = [0.5 / value, 0.5 * energy / value];
        let variance = match &self.fit.covariance {
            Some(cov) => (0..2)
                .flat_map(|i| (0..2).map(move |j| (i, j)))
                .map(|(i, j)| jacobian[i] * cov[(i, j)] * jacobian[j])
                .sum::<f64>(),
            None => (jacobian[0] * a.uncertainty).powi(2) + (jacobian[1] * b.uncertainty).powi(2),
        };
        Measurement::new(value, variance.abs().sqrt())
    }
}

/// One reference line that made it into the calibration.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CalibrationPeak {
    /// Reference energy in keV.
    pub energy: f64,
    /// Raw fit window.
    pub window: (f64, f64),
    pub fit: PeakFit,
    pub position: Measurement,
    pub fwhm_raw: Measurement,
    pub fwhm_kev: Measurement,
    /// Calibrated position with the curve uncertainty folded in.
    pub calibrated: Measurement,
    /// `calibrated - energy` in keV.
    pub residual_kev: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnergyCalibration {
    pub rough: RoughCalibration,
    pub curve: CalibrationCurve,
    pub peaks: Vec<CalibrationPeak>,
    /// Reference energies whose peak could not be fitted.
    pub skipped: Vec<f64>,
    pub resolution: Option<ResolutionCurve>,
    pub diagnostics: Diagnostics,
}

impl EnergyCalibration {
    pub fn function(&self) -> &CalibrationFunction {
        &self.curve.function
    }

    pub fn p_value(&self) -> Option<f64> {
        self.curve.p_value()
    }
}

/// Rough linear scale, from the config or from matching found peaks to the reference lines.
pub fn rough_scale(samples: &[f64], config: &CalibrationConfig) -> Result<RoughCalibration> {
    if let Some(kev_per_unit) = config.rough_kev_per_unit {
        if !(kev_per_unit > 0.0 && kev_per_unit.is_finite()) {
            return Err(CalError::Contract(format!(
                "rough energy scale must be positive, got {kev_per_unit}"
            )));
        }
        return Ok(RoughCalibration {
            kev_per_unit,
            matches: Vec::new(),
        });
    }
    let sorted = statistics::sorted_finite(samples);
    let (Some(&lo), Some(&hi)) = (sorted.first(), sorted.last()) else {
        return Err(CalError::InsufficientData("no finite samples to calibrate".to_string()));
    };
    if !(hi > lo) {
        return Err(CalError::InsufficientData(format!(
            "all samples sit at {lo}, nothing to search"
        )));
    }
    let hist = Histogram::from_samples(&sorted, (lo, hi), Binning::Count(config.search_bins))?;
    let candidates = config.peak_finder.candidates(&hist);
    log::debug!("{} peak candidates in the search spectrum", candidates.len());
    match_reference_peaks(&candidates, &config.reference_energies, config.match_tolerance)
}

/// Rough scale search, a peak fit around every reference line, then the polynomial
/// calibration and resolution curves.
///
/// A line whose window is empty or whose fit fails is skipped with a warning; only when
/// fewer lines than polynomial coefficients remain does the whole calibration fail.
pub fn calibrate_energy(samples: &[f64], config: &CalibrationConfig) -> Result<EnergyCalibration> {
    if config.reference_energies.is_empty() {
        return Err(CalError::contract("no reference energies given"));
    }
    if config.reference_energies.iter().any(|e| !(*e > 0.0)) {
        return Err(CalError::contract("reference energies must be positive"));
    }
    if !(config.window_kev > 0.0) {
        return Err(CalError::Contract(format!(
            "fit window half width must be positive, got {}",
            config.window_kev
        )));
    }

    let mut diagnostics = Diagnostics::new();
    let rough = rough_scale(samples, config)?;
    log::info!("rough scale {:.6} keV per raw unit", rough.kev_per_unit);

    let mut fitted: Vec<(f64, (f64, f64), PeakFit)> = Vec::new();
    let mut skipped = Vec::new();
    for &energy in &config.reference_energies {
        let center = energy / rough.kev_per_unit;
        let half = config.window_kev / rough.kev_per_unit;
        let window = (center - half, center + half);
        match fit_line(samples, window, config) {
            Ok(fit) => fitted.push((energy, window, fit)),
            Err(e) if e.is_contract() => return Err(e),
            Err(e) => {
                diagnostics.warn("calibration", format!("skipping {energy} keV: {e}"));
                skipped.push(energy);
            }
        }
    }

    let positions: Vec<Measurement> = fitted.iter().map(|(_, _, fit)| fit.mu()).collect();
    let energies: Vec<Measurement> = fitted.iter().map(|(e, _, _)| Measurement::exact(*e)).collect();
    let curve = CalibrationCurve::fit(&positions, &energies, config.degree, &Chi2Options::default())?;
    diagnostics.extend(curve.fit.diagnostics.clone());

    let mut peaks = Vec::with_capacity(fitted.len());
    for (energy, window, fit) in fitted {
        let position = fit.mu();
        let calibrated = curve.energy(position)?;
        let fwhm_raw = fit.fwhm;
        peaks.push(CalibrationPeak {
            energy,
            window,
            position,
            fwhm_raw,
            fwhm_kev: curve.function.calibrate_width(fwhm_raw, position.value),
            calibrated,
            residual_kev: calibrated.value - energy,
            fit,
        });
    }

    let resolution = if config.fit_resolution && peaks.len() >= 3 {
        let energies: Vec<f64> = peaks.iter().map(|p| p.energy).collect();
        let widths: Vec<Measurement> = peaks.iter().map(|p| p.fwhm_kev).collect();
        match ResolutionCurve::fit(&energies, &widths) {
            Ok(curve) => Some(curve),
            Err(e) if e.is_contract() => return Err(e),
            Err(e) => {
                diagnostics.warn("resolution", format!("no resolution curve: {e}"));
                None
            }
        }
    } else {
        if config.fit_resolution {
            diagnostics.info("resolution", "fewer than 3 peaks, resolution curve skipped");
        }
        None
    };

    Ok(EnergyCalibration {
        rough,
        curve,
        peaks,
        skipped,
        resolution,
        diagnostics,
    })
}

fn fit_line(samples: &[f64], window: (f64, f64), config: &CalibrationConfig) -> Result<PeakFit> {
    let inside: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|v| *v >= window.0 && *v < window.1)
        .collect();
    if inside.len() < MIN_WINDOW_COUNTS {
        return Err(CalError::InsufficientData(format!(
            "{} samples in [{:.2}, {:.2}]",
            inside.len(),
            window.0,
            window.1
        )));
    }
    let hist = Histogram::from_samples(&inside, window, config.binning)?;
    let stats = PeakStats::estimate(&hist)?;
    if stats.is_degenerate() {
        return Err(CalError::InsufficientData(format!(
            "no usable peak estimate in [{:.2}, {:.2}]",
            window.0, window.1
        )));
    }
    let shape = config.peak_fit.shape;
    let guess = shape.initial_guess(&stats, hist.total(), hist.range());
    let fit = fit_peak_from(&hist, &guess, &config.peak_fit)?;

    let mu = fit.mu();
    if !(mu.value > window.0 && mu.value < window.1 && mu.uncertainty.is_finite() && mu.uncertainty > 0.0) {
        return Err(CalError::Numerical(format!("fitted position {mu} is unusable")));
    }
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn curve_recovers_exact_linear_scale() {
        let raw = [1000.0, 2500.0, 4000.0, 6500.0];
        let positions: Vec<Measurement> = raw.iter().map(|x| Measurement::new(*x, 0.1)).collect();
        let energies: Vec<Measurement> = raw.iter().map(|x| Measurement::exact(0.4 * x + 2.0)).collect();
        let curve = CalibrationCurve::fit(&positions, &energies, 1, &Chi2Options::default()).unwrap();

        assert_relative_eq!(curve.slope_at(3000.0), 0.4, max_relative = 1e-6);
        assert_relative_eq!(curve.function.eval(0.0), 2.0, epsilon = 1e-4);
        assert_eq!(curve.domain, (1000.0, 6500.0));

        let raw_back = curve.invert(1202.0).unwrap();
        assert_relative_eq!(raw_back, 3000.0, max_relative = 1e-8);

        let residuals = curve
            .residuals(&raw, &energies.iter().map(|e| e.value).collect::<Vec<_>>())
            .unwrap();
        assert!(residuals.iter().all(|r| r.abs() < 1e-4));

        // position uncertainty alone gives at least slope * 0.1
        let e = curve.energy(Measurement::new(3000.0, 0.1)).unwrap();
        assert!(e.uncertainty >= 0.04 * 0.999);
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let positions = [Measurement::new(100.0, 0.1)];
        let energies = [Measurement::exact(40.0)];
        let err = CalibrationCurve::fit(&positions, &energies, 1, &Chi2Options::default()).unwrap_err();
        assert!(matches!(err, CalError::InsufficientData(_)));

        let err = CalibrationCurve::fit(&positions, &[], 1, &Chi2Options::default()).unwrap_err();
        assert!(err.is_contract());
    }

    #[test]
    fn resolution_curve_fits_square_root_law() {
        let energies: [f64; 5] = [583.0, 861.0, 1620.0, 2103.0, 2614.0];
        let widths: Vec<Measurement> = energies
            .iter()
            .map(|e| Measurement::new((2.0 + 0.001 * e).sqrt(), 0.01))
            .collect();
        let curve = ResolutionCurve::fit(&energies, &widths).unwrap();
        assert_relative_eq!(curve.a().value, 2.0, max_relative = 1e-3);
        assert_relative_eq!(curve.b().value, 0.001, max_relative = 1e-3);

        let at = curve.fwhm_at(1000.0);
        assert_relative_eq!(at.value, 3.0_f64.sqrt(), max_relative = 1e-4);
        assert!(at.uncertainty > 0.0 && at.uncertainty < 0.01);
    }

    #[test]
    fn fixed_rough_scale_must_be_positive() {
        let config = CalibrationConfig {
            rough_kev_per_unit: Some(-1.0),
            ..CalibrationConfig::default()
        };
        assert!(rough_scale(&[1.0, 2.0], &config).unwrap_err().is_contract());

        let config = CalibrationConfig {
            reference_energies: Vec::new(),
            ..CalibrationConfig::default()
        };
        assert!(calibrate_energy(&[1.0, 2.0], &config).unwrap_err().is_contract());
    }

    #[test]
    fn empty_windows_are_skipped_not_fatal_until_too_few_remain() {
        // every sample sits near 1000 raw units, so only one line has data
        let samples: Vec<f64> = (0..2000).map(|i| 1000.0 + (i % 7) as f64 * 0.3).collect();
        let config = CalibrationConfig {
            rough_kev_per_unit: Some(0.583191),
            ..CalibrationConfig::default()
        };
        let err = calibrate_energy(&samples, &config).unwrap_err();
        assert!(matches!(err, CalError::InsufficientData(_)));
    }
}
