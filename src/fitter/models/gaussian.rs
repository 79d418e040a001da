use statrs::function::erf::erfc;

use crate::histoer::peak_stats::FWHM_PER_SIGMA;

const SQRT_2PI: f64 = 2.506_628_274_631_000_5;

pub fn gauss_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    (-0.5 * z * z).exp() / (sigma * SQRT_2PI)
}

/// Standard normal CDF, accurate in both tails.
pub fn norm_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Probability mass of `N(mu, sigma)` inside `[lo, hi]`.
pub fn gauss_mass(lo: f64, hi: f64, mu: f64, sigma: f64) -> f64 {
    let a = (lo - mu) / sigma;
    let b = (hi - mu) / sigma;
    // subtract on the side of the shorter tail to keep precision
    if a > 0.0 {
        norm_cdf(-a) - norm_cdf(-b)
    } else {
        norm_cdf(b) - norm_cdf(a)
    }
}

/// Gaussian normalized to one inside `[lo, hi]`, zero outside.
pub fn truncated_gauss_pdf(x: f64, mu: f64, sigma: f64, range: (f64, f64)) -> f64 {
    if x < range.0 || x > range.1 {
        return 0.0;
    }
    let mass = gauss_mass(range.0, range.1, mu, sigma);
    if mass > 0.0 {
        gauss_pdf(x, mu, sigma) / mass
    } else {
        0.0
    }
}

pub fn gauss_fwhm(sigma: f64) -> f64 {
    FWHM_PER_SIGMA * sigma
}

pub fn gauss_height(n: f64, sigma: f64) -> f64 {
    n / (sigma * SQRT_2PI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pdf_and_mass() {
        assert_relative_eq!(gauss_pdf(1.0, 1.0, 2.0), 1.0 / (2.0 * SQRT_2PI));
        assert_relative_eq!(gauss_mass(-1.0, 1.0, 0.0, 1.0), 0.682_689_492, epsilon = 1e-8);
        assert_relative_eq!(gauss_mass(8.0, 9.0, 0.0, 1.0), 6.22e-16, max_relative = 1e-2);
    }

    #[test]
    fn truncated_pdf_integrates_to_one() {
        let range = (-1.0, 3.0);
        let n = 4000;
        let dx = (range.1 - range.0) / n as f64;
        let integral: f64 = (0..n)
            .map(|i| truncated_gauss_pdf(range.0 + (i as f64 + 0.5) * dx, 0.5, 1.2, range) * dx)
            .sum();
        assert_relative_eq!(integral, 1.0, epsilon = 1e-6);
        assert_eq!(truncated_gauss_pdf(4.0, 0.5, 1.2, range), 0.0);
    }
}
