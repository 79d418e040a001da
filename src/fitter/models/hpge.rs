// Low-energy tail and step background of HPGe photopeaks.

use statrs::function::erf::erfc;

const FRAC_1_SQRT_PI: f64 = 0.564_189_583_547_756_3;

/// Scaled complementary error function `exp(b^2) * erfc(b)` for large positive `b`.
fn erfcx_asymptotic(b: f64) -> f64 {
    let inv = 1.0 / (b * b);
    FRAC_1_SQRT_PI / b
        * (1.0 - 0.5 * inv + 0.75 * inv * inv - 1.875 * inv.powi(3) + 6.5625 * inv.powi(4))
}

/// Exponentially modified Gaussian extending below `mu`, normalized over the real line.
pub fn tail_pdf(x: f64, mu: f64, sigma: f64, tau: f64) -> f64 {
    let z = (x - mu) / sigma;
    let b = (z + sigma / tau) / std::f64::consts::SQRT_2;
    if b < 20.0 {
        let a = (x - mu) / tau + sigma * sigma / (2.0 * tau * tau);
        0.5 / tau * a.exp() * erfc(b)
    } else {
        0.5 / tau * (-0.5 * z * z).exp() * erfcx_asymptotic(b)
    }
}

/// Unnormalized step `1 + hstep * erfc((x - mu) / (sqrt(2) sigma))`, higher below the peak.
pub fn step(x: f64, mu: f64, sigma: f64, hstep: f64) -> f64 {
    1.0 + hstep * erfc((x - mu) / (std::f64::consts::SQRT_2 * sigma))
}

// Antiderivative of erfc((x - mu) / (sqrt(2) sigma)) in x.
fn erfc_antiderivative(x: f64, mu: f64, sigma: f64) -> f64 {
    let s = std::f64::consts::SQRT_2 * sigma;
    let u = (x - mu) / s;
    s * (u * erfc(u) - (-u * u).exp() * FRAC_1_SQRT_PI)
}

pub fn step_integral(range: (f64, f64), mu: f64, sigma: f64, hstep: f64) -> f64 {
    (range.1 - range.0)
        + hstep * (erfc_antiderivative(range.1, mu, sigma) - erfc_antiderivative(range.0, mu, sigma))
}

/// Step normalized to unit area over `range`.
pub fn step_pdf(x: f64, mu: f64, sigma: f64, hstep: f64, range: (f64, f64)) -> f64 {
    let norm = step_integral(range, mu, sigma, hstep);
    if norm > 0.0 {
        step(x, mu, sigma, hstep) / norm
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn integrate(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
        let n = 20_000;
        let dx = (hi - lo) / n as f64;
        (0..n).map(|i| f(lo + (i as f64 + 0.5) * dx) * dx).sum()
    }

    #[test]
    fn tail_is_normalized_and_continuous() {
        let integral = integrate(|x| tail_pdf(x, 0.0, 1.0, 2.0), -60.0, 15.0);
        assert_relative_eq!(integral, 1.0, epsilon = 1e-5);

        // both branches agree where they meet
        let sigma = 1.0;
        let tau = 0.5;
        let x_switch = (20.0 * std::f64::consts::SQRT_2 - sigma / tau) * sigma;
        let below = tail_pdf(x_switch - 1e-9, 0.0, sigma, tau);
        let above = tail_pdf(x_switch + 1e-9, 0.0, sigma, tau);
        assert_relative_eq!(below, above, max_relative = 1e-6);
    }

    #[test]
    fn tail_sits_below_the_peak() {
        assert!(tail_pdf(-3.0, 0.0, 1.0, 2.0) > tail_pdf(3.0, 0.0, 1.0, 2.0));
    }

    #[test]
    fn step_integral_matches_quadrature() {
        let range = (-10.0, 12.0);
        let numeric = integrate(|x| step(x, 1.0, 1.5, 0.3), range.0, range.1);
        assert_relative_eq!(step_integral(range, 1.0, 1.5, 0.3), numeric, epsilon = 1e-6);
        assert_relative_eq!(
            integrate(|x| step_pdf(x, 1.0, 1.5, 0.3, range), range.0, range.1),
            1.0,
            epsilon = 1e-6
        );
    }
}
