use super::histogram1d::Histogram;
use crate::error::{CalError, Result};

pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Heuristic peak estimate from a histogram. Only ever used as a fit start point.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PeakStats {
    pub position: f64,
    pub fwhm: f64,
    pub sigma: f64,
    /// Net peak counts above the background estimate.
    pub amplitude: f64,
    /// Background counts over the whole histogram.
    pub background: f64,
    /// Background-subtracted counts in the maximum bin.
    pub height: f64,
}

impl PeakStats {
    pub fn estimate(hist: &Histogram) -> Result<PeakStats> {
        let total = hist.total();
        if total <= 0.0 {
            return Err(CalError::contract(
                "cannot estimate a peak from a histogram with zero counts",
            ));
        }

        let n = hist.n_bins();
        let centers = hist.centers();
        let widths = hist.widths();

        // flat background from the outer tenth of the bins on each side
        let k = (n / 10).max(1);
        let edge_bins: Vec<f64> = hist.counts[..k]
            .iter()
            .chain(&hist.counts[n - k..])
            .copied()
            .collect();
        let mut background_per_bin = edge_bins.iter().sum::<f64>() / edge_bins.len() as f64;

        let (imax, _) = hist.max_bin();
        if hist.counts[imax] <= background_per_bin {
            // no structure above the edges, treat the whole window as signal
            background_per_bin = 0.0;
        }
        let height = hist.counts[imax] - background_per_bin;
        let half = 0.5 * height;
        let net = |i: usize| hist.counts[i] - background_per_bin;

        let mut left = centers[0] - 0.5 * widths[0];
        for i in (0..imax).rev() {
            if net(i) < half {
                let (x0, y0, x1, y1) = (centers[i], net(i), centers[i + 1], net(i + 1));
                left = if y1 > y0 {
                    x0 + (half - y0) * (x1 - x0) / (y1 - y0)
                } else {
                    x0
                };
                break;
            }
        }

        let mut right = centers[n - 1] + 0.5 * widths[n - 1];
        for i in imax + 1..n {
            if net(i) < half {
                let (x0, y0, x1, y1) = (centers[i - 1], net(i - 1), centers[i], net(i));
                right = if y0 > y1 {
                    x0 + (y0 - half) * (x1 - x0) / (y0 - y1)
                } else {
                    x1
                };
                break;
            }
        }

        let fwhm = (right - left).max(widths[imax]);
        let sigma = fwhm / FWHM_PER_SIGMA;

        // centroid of the net counts within one FWHM of the maximum
        let (sum_w, sum_wx) = centers
            .iter()
            .enumerate()
            .filter(|(_, x)| (**x - centers[imax]).abs() <= fwhm)
            .map(|(i, x)| (net(i).max(0.0), *x))
            .fold((0.0, 0.0), |(sw, swx), (w, x)| (sw + w, swx + w * x));
        let position = if sum_w > 0.0 { sum_wx / sum_w } else { centers[imax] };

        let background = background_per_bin * n as f64;
        let amplitude = total - background;

        log::debug!(
            "peak stats: position {position:.3}, fwhm {fwhm:.3}, amplitude {amplitude:.1}, background {background:.1}"
        );

        Ok(PeakStats {
            position,
            fwhm,
            sigma,
            amplitude,
            background,
            height,
        })
    }

    /// True when a fit started from these numbers cannot work.
    pub fn is_degenerate(&self) -> bool {
        !(self.position.is_finite()
            && self.sigma.is_finite()
            && self.sigma > 0.0
            && self.amplitude > 0.0
            && self.height > 0.0)
    }
}
