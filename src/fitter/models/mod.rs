pub mod gaussian;
pub mod hpge;

use crate::histoer::peak_stats::PeakStats;

use gaussian::{gauss_fwhm, gauss_height, gauss_pdf, truncated_gauss_pdf};
use hpge::{step_pdf, tail_pdf};

/// Peakshape models fitted to histogrammed counts.
///
/// Parameter vectors, in order:
/// - `GaussOnUniform`: `[n_sig, mu, sigma, n_bkg]`
/// - `GaussOnStep`: `[n_sig, mu, sigma, n_bkg, hstep]`
/// - `HpgePeak`: `[n_sig, mu, sigma, htail, tau, n_bkg, hstep]`
/// - `TruncatedGauss`: `[n, mu, sigma]`
/// - `DoubleGauss`: `[n1, mu1, sigma1, n2, mu2, sigma2]`
///
/// Background and truncated-Gaussian counts are counts inside the fit window, signal
/// counts are integrated over the real line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakShape {
    #[default]
    GaussOnUniform,
    GaussOnStep,
    HpgePeak,
    TruncatedGauss,
    DoubleGauss,
}

/// Density of a peakshape at one point, split by origin.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Components {
    pub signal: f64,
    /// Low-energy tail; the second Gaussian for `DoubleGauss`.
    pub tail: f64,
    pub background: f64,
}

impl Components {
    pub fn total(&self) -> f64 {
        self.signal + self.tail + self.background
    }
}

impl PeakShape {
    // shared by every shape
    pub const N_SIGNAL: usize = 0;
    pub const MU: usize = 1;
    pub const SIGMA: usize = 2;

    pub fn parameter_names(self) -> &'static [&'static str] {
        match self {
            PeakShape::GaussOnUniform => &["n_sig", "mu", "sigma", "n_bkg"],
            PeakShape::GaussOnStep => &["n_sig", "mu", "sigma", "n_bkg", "hstep"],
            PeakShape::HpgePeak => &["n_sig", "mu", "sigma", "htail", "tau", "n_bkg", "hstep"],
            PeakShape::TruncatedGauss => &["n", "mu", "sigma"],
            PeakShape::DoubleGauss => &["n1", "mu1", "sigma1", "n2", "mu2", "sigma2"],
        }
    }

    pub fn n_params(self) -> usize {
        self.parameter_names().len()
    }

    pub fn index_of(self, name: &str) -> Option<usize> {
        self.parameter_names().iter().position(|n| *n == name)
    }

    pub fn has_tail(self) -> bool {
        matches!(self, PeakShape::HpgePeak)
    }

    pub fn components(self, x: f64, p: &[f64], range: (f64, f64)) -> Components {
        let width = range.1 - range.0;
        match self {
            PeakShape::GaussOnUniform => Components {
                signal: p[0] * gauss_pdf(x, p[1], p[2]),
                tail: 0.0,
                background: p[3] / width,
            },
            PeakShape::GaussOnStep => Components {
                signal: p[0] * gauss_pdf(x, p[1], p[2]),
                tail: 0.0,
                background: p[3] * step_pdf(x, p[1], p[2], p[4], range),
            },
            PeakShape::HpgePeak => Components {
                signal: p[0] * (1.0 - p[3]) * gauss_pdf(x, p[1], p[2]),
                tail: p[0] * p[3] * tail_pdf(x, p[1], p[2], p[4]),
                background: p[5] * step_pdf(x, p[1], p[2], p[6], range),
            },
            PeakShape::TruncatedGauss => Components {
                signal: p[0] * truncated_gauss_pdf(x, p[1], p[2], range),
                tail: 0.0,
                background: 0.0,
            },
            PeakShape::DoubleGauss => Components {
                signal: p[0] * gauss_pdf(x, p[1], p[2]),
                tail: p[3] * gauss_pdf(x, p[4], p[5]),
                background: 0.0,
            },
        }
    }

    pub fn density(self, x: f64, p: &[f64], range: (f64, f64)) -> f64 {
        self.components(x, p, range).total()
    }

    /// Start point for a fit inside `range`.
    pub fn initial_guess(self, stats: &PeakStats, total: f64, range: (f64, f64)) -> Vec<f64> {
        let n_sig = stats.amplitude;
        let n_bkg = stats.background.max(0.0);
        match self {
            PeakShape::GaussOnUniform => vec![n_sig, stats.position, stats.sigma, n_bkg],
            PeakShape::GaussOnStep => vec![n_sig, stats.position, stats.sigma, n_bkg, 0.01],
            PeakShape::HpgePeak => vec![
                n_sig,
                stats.position,
                stats.sigma,
                0.1,
                stats.sigma,
                n_bkg,
                0.01,
            ],
            PeakShape::TruncatedGauss => vec![total, stats.position, stats.sigma],
            PeakShape::DoubleGauss => vec![
                0.8 * total,
                stats.position,
                stats.sigma,
                0.2 * total,
                stats.position,
                (3.0 * stats.sigma).min(range.1 - range.0),
            ],
        }
    }

    /// Box constraints, fixed from the start point.
    pub fn bounds(self, guess: &[f64], range: (f64, f64)) -> Vec<(f64, f64)> {
        let width = range.1 - range.0;
        let counts = (0.0, f64::INFINITY);
        let position = (range.0, range.1);
        let sigma = (1e-6 * width, width);
        match self {
            PeakShape::GaussOnUniform => vec![counts, position, sigma, counts],
            PeakShape::GaussOnStep => vec![counts, position, sigma, counts, (0.0, 1.0)],
            PeakShape::HpgePeak => {
                let sigma0 = guess[2].max(sigma.0);
                vec![
                    counts,
                    position,
                    sigma,
                    (0.0, 0.75),
                    (0.02 * sigma0, 50.0 * sigma0),
                    counts,
                    (0.0, 1.0),
                ]
            }
            PeakShape::TruncatedGauss => vec![counts, position, (1e-6 * width, 10.0 * width)],
            PeakShape::DoubleGauss => vec![
                counts,
                position,
                sigma,
                counts,
                position,
                (1e-6 * width, 2.0 * width),
            ],
        }
    }

    /// Typical size of a one-sigma change in each parameter, used to condition the minimizer.
    pub fn scales(self, guess: &[f64]) -> Vec<f64> {
        let count_scale = |n: f64| n.max(0.0).sqrt() + 1.0;
        let gauss = |n: f64, sigma: f64| {
            let root_n = n.max(1.0).sqrt();
            (sigma / root_n, sigma / (std::f64::consts::SQRT_2 * root_n))
        };
        match self {
            PeakShape::GaussOnUniform | PeakShape::GaussOnStep | PeakShape::HpgePeak => {
                let (mu_scale, sigma_scale) = gauss(guess[0], guess[2]);
                let mut scales = vec![count_scale(guess[0]), mu_scale, sigma_scale];
                match self {
                    PeakShape::GaussOnUniform => scales.push(count_scale(guess[3])),
                    PeakShape::GaussOnStep => scales.extend([count_scale(guess[3]), 0.01]),
                    _ => scales.extend([0.05, 0.3 * guess[4], count_scale(guess[5]), 0.01]),
                }
                scales
            }
            PeakShape::TruncatedGauss => {
                let (mu_scale, sigma_scale) = gauss(guess[0], guess[2]);
                vec![count_scale(guess[0]), mu_scale, sigma_scale]
            }
            PeakShape::DoubleGauss => {
                let (mu1, sigma1) = gauss(guess[0], guess[2]);
                let (mu2, sigma2) = gauss(guess[3], guess[5]);
                vec![count_scale(guess[0]), mu1, sigma1, count_scale(guess[3]), mu2, sigma2]
            }
        }
    }

    /// Signal shape (signal plus tail, no background) per unit count, for FWHM and height.
    fn unit_signal(self, x: f64, p: &[f64]) -> f64 {
        match self {
            PeakShape::HpgePeak => {
                (1.0 - p[3]) * gauss_pdf(x, p[1], p[2]) + p[3] * tail_pdf(x, p[1], p[2], p[4])
            }
            _ => gauss_pdf(x, p[1], p[2]),
        }
    }

    pub fn fwhm(self, p: &[f64]) -> f64 {
        if self.has_tail() && p[3] > 0.0 {
            numeric_fwhm(|x| self.unit_signal(x, p), p[1], p[2]).0
        } else {
            gauss_fwhm(p[2])
        }
    }

    /// Maximum of the signal density (counts per x unit).
    pub fn peak_height(self, p: &[f64], range: (f64, f64)) -> f64 {
        match self {
            PeakShape::HpgePeak if p[3] > 0.0 => {
                p[0] * numeric_fwhm(|x| self.unit_signal(x, p), p[1], p[2]).1
            }
            PeakShape::TruncatedGauss => {
                let mode = p[1].clamp(range.0, range.1);
                p[0] * truncated_gauss_pdf(mode, p[1], p[2], range)
            }
            _ => gauss_height(p[0], p[2]),
        }
    }

    /// Indices of the parameters that count events.
    pub fn count_parameters(self) -> &'static [usize] {
        match self {
            PeakShape::GaussOnUniform | PeakShape::GaussOnStep | PeakShape::DoubleGauss => &[0, 3],
            PeakShape::HpgePeak => &[0, 5],
            PeakShape::TruncatedGauss => &[0],
        }
    }
}

/// FWHM and maximum of a unimodal function peaking within a few `sigma` of `mu`.
fn numeric_fwhm(f: impl Fn(f64) -> f64, mu: f64, sigma: f64) -> (f64, f64) {
    // coarse grid, then golden-section refinement of the mode
    let (lo, hi) = (mu - 6.0 * sigma, mu + 3.0 * sigma);
    let n = 900;
    let dx = (hi - lo) / n as f64;
    let (mut best_x, mut best_f) = (mu, f(mu));
    for i in 0..=n {
        let x = lo + i as f64 * dx;
        let value = f(x);
        if value > best_f {
            best_x = x;
            best_f = value;
        }
    }
    let (mut a, mut b) = (best_x - dx, best_x + dx);
    let ratio = 0.5 * (5f64.sqrt() - 1.0);
    for _ in 0..60 {
        let c = b - ratio * (b - a);
        let d = a + ratio * (b - a);
        if f(c) > f(d) {
            b = d;
        } else {
            a = c;
        }
    }
    let mode = 0.5 * (a + b);
    let f_max = f(mode).max(best_f);
    let half = 0.5 * f_max;

    let crossing = |direction: f64| {
        let mut inner = mode;
        let mut outer = mode;
        let step = 0.25 * sigma;
        for _ in 0..100_000 {
            outer += direction * step;
            if f(outer) < half {
                break;
            }
            inner = outer;
        }
        for _ in 0..80 {
            let mid = 0.5 * (inner + outer);
            if f(mid) >= half {
                inner = mid;
            } else {
                outer = mid;
            }
        }
        0.5 * (inner + outer)
    };

    (crossing(1.0) - crossing(-1.0), f_max)
}
