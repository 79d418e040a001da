//! Option bundles read by the fitting, calibration and sweep code.
//!
//! Everything deserializes with defaults for missing keys, so a YAML file only needs the
//! values it changes.

use crate::error::Result;
use crate::fitter::goodness::GoodnessMethod;
use crate::fitter::models::PeakShape;
use crate::fitter::optimizer::{Method, OptimizerConfig};
use crate::histoer::histogram1d::Binning;
use crate::histoer::peak_finder::PeakFindingSettings;

/// Th-228 chain lines in keV, including the 2614.5 keV double and single escape peaks.
pub const TH228_LINES: [f64; 7] = [583.191, 727.330, 860.564, 1592.53, 1620.50, 2103.53, 2614.511];

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PeakFitConfig {
    pub shape: PeakShape,
    pub compute_uncertainty: bool,
    pub goodness: GoodnessMethod,
    /// Resamples for the Monte-Carlo p-value.
    pub mc_samples: usize,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
}

impl Default for PeakFitConfig {
    fn default() -> Self {
        Self {
            shape: PeakShape::GaussOnUniform,
            compute_uncertainty: true,
            goodness: GoodnessMethod::LeastSquares,
            mc_samples: 1000,
            seed: 0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl PeakFitConfig {
    pub fn with_shape(shape: PeakShape) -> Self {
        Self {
            shape,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub reference_energies: Vec<f64>,
    /// Half width of each peak fit window in keV.
    pub window_kev: f64,
    pub degree: usize,
    /// Skips the automatic peak search when set.
    pub rough_kev_per_unit: Option<f64>,
    /// Relative tolerance when matching found peaks to reference lines.
    pub match_tolerance: f64,
    /// Bins of the histogram searched for candidate peaks.
    pub search_bins: usize,
    pub peak_finder: PeakFindingSettings,
    pub binning: Binning,
    pub peak_fit: PeakFitConfig,
    pub fit_resolution: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_energies: TH228_LINES.to_vec(),
            window_kev: 10.0,
            degree: 1,
            rough_kev_per_unit: None,
            match_tolerance: 0.005,
            search_bins: 8192,
            peak_finder: PeakFindingSettings::default(),
            binning: Binning::Auto,
            peak_fit: PeakFitConfig::default(),
            fit_resolution: true,
        }
    }
}

impl CalibrationConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Grid points with fewer finite samples are skipped.
    pub min_points: usize,
    /// Fit window half width in estimated peak (or robust noise) sigmas.
    pub window_sigma: f64,
    pub binning: Binning,
    /// Reported optimum when no grid point gives a valid metric.
    pub default_value: Option<f64>,
    pub peak_fit: PeakFitConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_points: 100,
            window_sigma: 5.0,
            binning: Binning::Auto,
            default_value: None,
            peak_fit: PeakFitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SurvivalFractionConfig {
    /// Fraction of DEP events the PSD cut keeps.
    pub dep_acceptance: f64,
    pub min_points: usize,
    pub binning: Binning,
    pub default_value: Option<f64>,
    pub peak_fit: PeakFitConfig,
}

impl Default for SurvivalFractionConfig {
    fn default() -> Self {
        Self {
            dep_acceptance: 0.9,
            min_points: 100,
            binning: Binning::Auto,
            default_value: None,
            peak_fit: PeakFitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CtcConfig {
    /// `"percentile"`, `"single_gaussian"` or `"double_gaussian"`.
    pub dt_cutoff: String,
    pub dt_percentiles: (f64, f64),
    pub dt_n_sigma: f64,
    pub alpha_bounds: (f64, f64),
    pub default_alpha: f64,
    /// Cost spread at which the simplex search stops.
    pub tol: f64,
    pub max_iter: u64,
    /// Wall-clock budget in seconds.
    pub timeout: Option<f64>,
    pub window_sigma: f64,
    pub binning: Binning,
    pub min_points: usize,
    /// Drift-time bins of the LQ profile.
    pub profile_bins: usize,
    pub peak_fit: PeakFitConfig,
}

impl Default for CtcConfig {
    fn default() -> Self {
        Self {
            dt_cutoff: "percentile".to_string(),
            dt_percentiles: (0.01, 0.99),
            dt_n_sigma: 3.0,
            alpha_bounds: (0.0, 1e-4),
            default_alpha: 0.0,
            tol: 1e-6,
            max_iter: 200,
            timeout: None,
            window_sigma: 5.0,
            binning: Binning::Auto,
            min_points: 100,
            profile_bins: 10,
            peak_fit: PeakFitConfig::default(),
        }
    }
}

impl CtcConfig {
    pub(crate) fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig {
            method: Method::NelderMead,
            max_iter: self.max_iter,
            tol: self.tol,
            simplex_step: 1.0,
            timeout: self.timeout,
            ..OptimizerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_only_given_keys() {
        let config = CalibrationConfig::from_yaml_str(
            "degree: 2\nwindow_kev: 6.5\npeak_fit:\n  shape: hpge_peak\n  goodness: log_likelihood_ratio\nbinning: !width 0.5\n",
        )
        .unwrap();
        assert_eq!(config.degree, 2);
        assert_eq!(config.window_kev, 6.5);
        assert_eq!(config.peak_fit.shape, PeakShape::HpgePeak);
        assert_eq!(config.peak_fit.goodness, GoodnessMethod::LogLikelihoodRatio);
        assert_eq!(config.binning, Binning::Width(0.5));
        assert_eq!(config.reference_energies, TH228_LINES.to_vec());
        assert!(config.fit_resolution);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = CalibrationConfig::from_yaml_str("degree: [1, 2").unwrap_err();
        assert!(matches!(err, crate::error::CalError::Config(_)));
    }

    #[test]
    fn ctc_config_round_trips_through_ron() {
        let config = CtcConfig {
            dt_cutoff: "double_gaussian".to_string(),
            timeout: Some(2.5),
            ..CtcConfig::default()
        };
        let text = ron::to_string(&config).unwrap();
        let back: CtcConfig = ron::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
