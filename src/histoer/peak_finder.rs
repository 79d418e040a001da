use find_peaks::PeakFinder;

use super::histogram1d::Histogram;
use crate::error::{CalError, Result};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PeakFindingSettings {
    pub min_height: f64,
    pub min_prominence: f64,
    pub min_distance: usize,
    pub max_candidates: usize,

    pub enable_min_height: bool,
    pub enable_min_prominence: bool,
    pub enable_min_distance: bool,
}

impl Default for PeakFindingSettings {
    fn default() -> Self {
        PeakFindingSettings {
            min_height: 0.0,
            min_prominence: 20.0,
            min_distance: 3,
            max_candidates: 30,

            enable_min_height: false,
            enable_min_prominence: true,
            enable_min_distance: true,
        }
    }
}

/// A local maximum found in a histogram.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeakCandidate {
    pub position: f64,
    pub prominence: f64,
}

impl PeakFindingSettings {
    pub fn find_peaks(&self, y_data: &[f64]) -> Vec<find_peaks::Peak<f64>> {
        let mut peak_finder = PeakFinder::new(y_data);

        if self.enable_min_height {
            peak_finder.with_min_height(self.min_height);
        }

        if self.enable_min_prominence {
            peak_finder.with_min_prominence(self.min_prominence);
        }

        if self.enable_min_distance {
            peak_finder.with_min_distance(self.min_distance);
        }

        peak_finder.find_peaks()
    }

    /// Candidate peak positions in x units, most prominent first.
    pub fn candidates(&self, hist: &Histogram) -> Vec<PeakCandidate> {
        let centers = hist.centers();
        let mut candidates: Vec<PeakCandidate> = self
            .find_peaks(&hist.counts)
            .iter()
            .map(|peak| PeakCandidate {
                position: centers[peak.middle_position().min(centers.len() - 1)],
                prominence: peak.prominence.unwrap_or(0.0),
            })
            .collect();
        candidates.sort_by(|a, b| b.prominence.total_cmp(&a.prominence));
        candidates.truncate(self.max_candidates);
        candidates
    }
}

/// Linear energy scale estimated by matching found peaks against known lines.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoughCalibration {
    pub kev_per_unit: f64,
    /// (reference energy, raw position) pairs that agree with the scale.
    pub matches: Vec<(f64, f64)>,
}

/// Tries every candidate/line pairing as the scale anchor and keeps the scale that puts
/// the most candidates within `tolerance` (relative) of a reference line.
pub fn match_reference_peaks(
    candidates: &[PeakCandidate],
    reference_energies: &[f64],
    tolerance: f64,
) -> Result<RoughCalibration> {
    if reference_energies.is_empty() {
        return Err(CalError::contract("no reference energies given"));
    }
    let positions: Vec<f64> = candidates
        .iter()
        .map(|c| c.position)
        .filter(|p| *p > 0.0)
        .collect();

    let mut best: Option<(usize, f64, f64)> = None;
    for &anchor in &positions {
        for &line in reference_energies {
            let scale = line / anchor;
            let mut matched = 0;
            let mut deviation = 0.0;
            for &energy in reference_energies {
                let closest = positions
                    .iter()
                    .map(|p| (scale * p - energy).abs())
                    .fold(f64::INFINITY, f64::min);
                if closest <= tolerance * energy {
                    matched += 1;
                    deviation += closest / energy;
                }
            }
            let better = match best {
                None => true,
                Some((best_matched, best_dev, _)) => {
                    matched > best_matched || (matched == best_matched && deviation < best_dev)
                }
            };
            if better {
                best = Some((matched, deviation, scale));
            }
        }
    }

    let Some((matched, _, scale)) = best else {
        return Err(CalError::InsufficientData(
            "no peak candidates to match against reference lines".to_string(),
        ));
    };
    if matched < 2 {
        return Err(CalError::InsufficientData(format!(
            "only {matched} reference line(s) matched found peaks"
        )));
    }

    let matches = reference_energies
        .iter()
        .filter_map(|&energy| {
            positions
                .iter()
                .copied()
                .filter(|p| (scale * p - energy).abs() <= tolerance * energy)
                .min_by(|a, b| (scale * a - energy).abs().total_cmp(&(scale * b - energy).abs()))
                .map(|p| (energy, p))
        })
        .collect();

    log::info!("rough energy scale {scale:.6} keV per unit from {matched} lines");

    Ok(RoughCalibration {
        kev_per_unit: scale,
        matches,
    })
}
