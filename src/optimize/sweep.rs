//! Grid sweeps of one processing parameter against a fitted resolution metric.
//!
//! Every grid point is evaluated independently. A point whose data are too thin or whose
//! fit fails is logged and recorded with a NaN metric, the sweep carries on, and the
//! optimum is picked among the points that produced a finite metric.

use crate::config::PeakFitConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{CalError, Result};
use crate::fitter::binned::{PeakFit, fit_peak_from};
use crate::fitter::models::PeakShape;
use crate::histoer::histogram1d::{Binning, Histogram};
use crate::histoer::peak_stats::PeakStats;
use crate::util::measurement::Measurement;
use crate::util::statistics;

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SweepPoint {
    pub value: f64,
    /// NaN when the point was skipped.
    pub metric: Measurement,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SweepResult {
    pub parameter: String,
    pub points: Vec<SweepPoint>,
    /// Best grid value, with the mean grid spacing as uncertainty.
    pub optimum: Measurement,
    /// Metric at the optimum, NaN when no point was usable.
    pub metric: Measurement,
    pub diagnostics: Diagnostics,
}

impl SweepResult {
    pub fn is_valid(&self) -> bool {
        self.metric.value.is_finite()
    }

    pub fn n_valid(&self) -> usize {
        self.points
            .iter()
            .filter(|p| p.metric.value.is_finite())
            .count()
    }
}

/// Calls `evaluate(index, value, diagnostics)` for every grid value and keeps the one with
/// the smallest metric.
///
/// Contract violations raised by `evaluate` abort the sweep, any other error only skips
/// the point. Without a single usable point the optimum is `default_value` (NaN if none).
pub fn sweep<F>(
    parameter: &str,
    grid: &[f64],
    default_value: Option<f64>,
    mut evaluate: F,
) -> Result<SweepResult>
where
    F: FnMut(usize, f64, &mut Diagnostics) -> Result<Measurement>,
{
    if grid.is_empty() {
        return Err(CalError::Contract(format!("{parameter} sweep has an empty grid")));
    }
    if grid.iter().any(|v| !v.is_finite()) {
        return Err(CalError::Contract(format!(
            "{parameter} sweep grid has non-finite values"
        )));
    }

    let mut diagnostics = Diagnostics::new();
    let mut points = Vec::with_capacity(grid.len());
    for (index, &value) in grid.iter().enumerate() {
        // long sweeps should not starve other threads
        std::thread::yield_now();
        let metric = match evaluate(index, value, &mut diagnostics) {
            Ok(metric) if metric.value.is_finite() => metric,
            Ok(metric) => {
                diagnostics.warn(parameter, format!("{value}: metric is {}", metric.value));
                Measurement::nan()
            }
            Err(e) if e.is_contract() => return Err(e),
            Err(e) => {
                diagnostics.warn(parameter, format!("{value}: skipped, {e}"));
                Measurement::nan()
            }
        };
        log::debug!("{parameter} = {value}: {metric}");
        points.push(SweepPoint { value, metric });
    }

    let spacing = mean_spacing(grid);
    let best = points
        .iter()
        .filter(|p| p.metric.value.is_finite())
        .min_by(|a, b| a.metric.value.total_cmp(&b.metric.value));

    let (optimum, metric) = match best {
        Some(point) => (Measurement::new(point.value, spacing), point.metric),
        None => {
            let fallback = default_value.unwrap_or(f64::NAN);
            diagnostics.warn(
                parameter,
                format!("no grid point gave a usable metric, falling back to {fallback}"),
            );
            (Measurement::new(fallback, f64::NAN), Measurement::nan())
        }
    };
    log::info!("{parameter} sweep optimum {optimum} (metric {metric})");

    Ok(SweepResult {
        parameter: parameter.to_string(),
        points,
        optimum,
        metric,
        diagnostics,
    })
}

fn mean_spacing(grid: &[f64]) -> f64 {
    if grid.len() < 2 {
        return 0.0;
    }
    grid.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (grid.len() - 1) as f64
}

/// The finite samples, or `InsufficientData` when fewer than `min_points` remain.
pub fn finite_samples(samples: &[f64], min_points: usize) -> Result<Vec<f64>> {
    let finite: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < min_points.max(1) {
        return Err(CalError::InsufficientData(format!(
            "{} finite samples, need {min_points}",
            finite.len()
        )));
    }
    Ok(finite)
}

/// Histograms `samples` inside `window` and fits `config.shape` from the peak estimate.
///
/// An empty window, a degenerate estimate or a non-positive count or width guess are
/// reported as `InsufficientData`.
pub fn guarded_fit(
    samples: &[f64],
    window: (f64, f64),
    binning: Binning,
    config: &PeakFitConfig,
) -> Result<PeakFit> {
    if !(window.0.is_finite() && window.1.is_finite() && window.1 > window.0) {
        return Err(CalError::InsufficientData(format!(
            "fit window [{}, {}] is empty",
            window.0, window.1
        )));
    }
    let inside: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|v| *v >= window.0 && *v < window.1)
        .collect();
    if inside.is_empty() {
        return Err(CalError::InsufficientData(format!(
            "no samples in [{}, {}]",
            window.0, window.1
        )));
    }
    let hist = Histogram::from_samples(&inside, window, binning)?;
    if hist.total() <= 0.0 {
        return Err(CalError::InsufficientData("fit histogram is empty".to_string()));
    }
    let stats = PeakStats::estimate(&hist)?;
    if stats.is_degenerate() {
        return Err(CalError::InsufficientData(format!(
            "degenerate peak estimate at {}",
            stats.position
        )));
    }
    let guess = config.shape.initial_guess(&stats, hist.total(), hist.range());
    if !(guess[PeakShape::N_SIGNAL] > 0.0 && guess[PeakShape::SIGMA] > 0.0) {
        return Err(CalError::InsufficientData(format!(
            "non-positive initial guess {guess:?}"
        )));
    }
    fit_peak_from(&hist, &guess, config)
}

/// `[median - n * robust_sigma, median + n * robust_sigma]` of the samples.
pub fn robust_window(samples: &[f64], n_sigma: f64) -> Result<(f64, f64)> {
    let center = statistics::median(samples);
    let width = statistics::robust_sigma(samples);
    if !(center.is_finite() && width.is_finite() && width > 0.0) {
        return Err(CalError::InsufficientData(format!(
            "no spread to size a window (median {center}, width {width})"
        )));
    }
    Ok((center - n_sigma * width, center + n_sigma * width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn picks_smallest_metric_and_reports_spacing() {
        let grid = [1.0, 2.0, 3.0, 4.0];
        let result = sweep("x", &grid, None, |_, v, _| Ok(Measurement::new((v - 2.6).powi(2), 0.1))).unwrap();
        assert_eq!(result.optimum.value, 3.0);
        assert_relative_eq!(result.optimum.uncertainty, 1.0);
        assert_eq!(result.n_valid(), 4);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn monotone_metric_selects_endpoint() {
        let grid = [0.5, 1.0, 1.5, 2.0, 2.5];
        let falling = sweep("x", &grid, None, |_, v, _| Ok(Measurement::exact(1.0 / v))).unwrap();
        assert_eq!(falling.optimum.value, 2.5);
        let rising = sweep("x", &grid, None, |_, v, _| Ok(Measurement::exact(v.exp()))).unwrap();
        assert_eq!(rising.optimum.value, 0.5);
    }

    #[test]
    fn failing_points_are_skipped() {
        let grid = [1.0, 2.0, 3.0];
        let result = sweep("x", &grid, None, |_, v, _| {
            if v == 1.0 {
                Err(CalError::InsufficientData("thin".to_string()))
            } else {
                Ok(Measurement::exact(v))
            }
        })
        .unwrap();
        assert_eq!(result.optimum.value, 2.0);
        assert!(result.points[0].metric.value.is_nan());
        assert!(result.diagnostics.has_warnings());
    }

    #[test]
    fn no_valid_point_falls_back_to_default() {
        let grid = [1.0, 2.0];
        let result = sweep("x", &grid, Some(7.0), |_, _, _| Ok(Measurement::exact(f64::NAN))).unwrap();
        assert_eq!(result.optimum.value, 7.0);
        assert!(result.metric.value.is_nan());
        assert!(!result.is_valid());

        let result = sweep("x", &grid, None, |_, _, _| Err(CalError::Numerical("boom".to_string()))).unwrap();
        assert!(result.optimum.value.is_nan());
    }

    #[test]
    fn contract_errors_abort() {
        let err = sweep("x", &[1.0], None, |_, _, _| Err(CalError::contract("bad option"))).unwrap_err();
        assert!(err.is_contract());
        assert!(sweep("x", &[], None, |_, _, _| Ok(Measurement::exact(1.0))).is_err());
    }

    #[test]
    fn guards_reject_thin_or_flat_data() {
        assert!(matches!(
            finite_samples(&[1.0, f64::NAN, 2.0], 3),
            Err(CalError::InsufficientData(_))
        ));
        assert_eq!(finite_samples(&[1.0, f64::NAN, 2.0], 2).unwrap(), vec![1.0, 2.0]);
        assert!(matches!(robust_window(&[1.0; 10], 3.0), Err(CalError::InsufficientData(_))));
        let config = PeakFitConfig::default();
        assert!(matches!(
            guarded_fit(&[1.0, 2.0], (5.0, 6.0), Binning::Count(10), &config),
            Err(CalError::InsufficientData(_))
        ));
    }
}
